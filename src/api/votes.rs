//! Local vote state for one post or comment.
//!
//! A vote is shown immediately by applying the score delta locally, then
//! replaced by whatever the server reports: the HTTP acknowledgement or a
//! `VoteUpdate` pushed over the realtime link. Server values always win, so
//! concurrent votes from other sessions cannot leave the local score drifting.

use crate::api::models::{TargetType, VoteResponse, VoteType};
use crate::realtime::messages::VoteUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteState {
    pub target_id: i64,
    pub target_type: TargetType,
    pub score: i64,
    pub user_vote: Option<VoteType>,
}

fn weight(vote: Option<VoteType>) -> i64 {
    vote.map_or(0, VoteType::weight)
}

/// Score change when a caller's vote moves from `previous` to `next`.
pub fn vote_delta(previous: Option<VoteType>, next: Option<VoteType>) -> i64 {
    weight(next) - weight(previous)
}

impl VoteState {
    pub fn new(target_type: TargetType, target_id: i64, score: i64, user_vote: Option<VoteType>) -> Self {
        Self {
            target_id,
            target_type,
            score,
            user_vote,
        }
    }

    /// The vote to send when the caller presses `pressed`: pressing the
    /// active vote again removes it.
    pub fn toggle(&self, pressed: VoteType) -> Option<VoteType> {
        if self.user_vote == Some(pressed) {
            None
        } else {
            Some(pressed)
        }
    }

    /// Show `next` locally before the server answers. Returns the state
    /// prior to the change so a failed request can be rolled back.
    pub fn apply_optimistic(&mut self, next: Option<VoteType>) -> VoteState {
        let before = *self;
        self.score += vote_delta(self.user_vote, next);
        self.user_vote = next;
        before
    }

    /// Adopt the server's answer to this caller's vote request.
    pub fn reconcile(&mut self, response: &VoteResponse) -> bool {
        if !self.matches(response.target_type, response.target_id) {
            return false;
        }
        self.score = response.new_score;
        self.user_vote = response.user_vote;
        true
    }

    /// Adopt a pushed vote update. Updates for other targets are ignored.
    pub fn reconcile_update(&mut self, update: &VoteUpdate) -> bool {
        if !self.matches(update.target_type, update.target_id) {
            return false;
        }
        self.score = update.new_score;
        self.user_vote = update.user_vote;
        true
    }

    pub fn rollback(&mut self, before: VoteState) {
        *self = before;
    }

    fn matches(&self, target_type: TargetType, target_id: i64) -> bool {
        self.target_type == target_type && self.target_id == target_id
    }
}
