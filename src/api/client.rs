//! Typed operations over the platform's REST resources.

use tracing::instrument;

use crate::api::models::{
    BanRequest, Comment, NewComment, NewPost, Post, SearchResults, Subreddit, TargetType,
    UserProfile, VoteRequest, VoteResponse, VoteType,
};
use crate::api::pagination::{Page, PageRequest};
use crate::api::request::ApiRequest;
use crate::auth::coordinator::TokenCoordinator;
use crate::error::ClientError;

/// REST client. Every call goes through the [`TokenCoordinator`], so expired
/// tokens are refreshed transparently.
#[derive(Debug, Clone)]
pub struct ApiClient {
    coordinator: TokenCoordinator,
}

impl ApiClient {
    pub fn new(coordinator: TokenCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &TokenCoordinator {
        &self.coordinator
    }

    // --- Posts ---

    /// List posts, optionally restricted to one subreddit.
    #[instrument(skip(self))]
    pub async fn list_posts(
        &self,
        subreddit_id: Option<i64>,
        page: &PageRequest,
    ) -> Result<Page<Post>, ClientError> {
        let mut request = page.apply(ApiRequest::get("/posts"));
        if let Some(id) = subreddit_id {
            request = request.query("subredditId", id);
        }
        self.coordinator.send_json(request).await
    }

    #[instrument(skip(self))]
    pub async fn get_post(&self, id: i64) -> Result<Post, ClientError> {
        self.coordinator
            .send_json(ApiRequest::get(format!("/posts/{id}")))
            .await
    }

    #[instrument(skip(self, post), fields(subreddit_id = post.subreddit_id))]
    pub async fn create_post(&self, post: &NewPost) -> Result<Post, ClientError> {
        let request = ApiRequest::post("/posts").json(post)?;
        self.coordinator.send_json(request).await
    }

    #[instrument(skip(self))]
    pub async fn delete_post(&self, id: i64) -> Result<(), ClientError> {
        self.coordinator
            .send_empty(ApiRequest::delete(format!("/posts/{id}")))
            .await
    }

    // --- Comments ---

    #[instrument(skip(self))]
    pub async fn list_comments(
        &self,
        post_id: i64,
        page: &PageRequest,
    ) -> Result<Page<Comment>, ClientError> {
        let request = page.apply(ApiRequest::get(format!("/posts/{post_id}/comments")));
        self.coordinator.send_json(request).await
    }

    #[instrument(skip(self, comment))]
    pub async fn create_comment(
        &self,
        post_id: i64,
        comment: &NewComment,
    ) -> Result<Comment, ClientError> {
        let request = ApiRequest::post(format!("/posts/{post_id}/comments")).json(comment)?;
        self.coordinator.send_json(request).await
    }

    // --- Subreddits ---

    #[instrument(skip(self))]
    pub async fn list_subreddits(&self, page: &PageRequest) -> Result<Page<Subreddit>, ClientError> {
        self.coordinator
            .send_json(page.apply(ApiRequest::get("/subreddits")))
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_subreddit(&self, id: i64) -> Result<Subreddit, ClientError> {
        self.coordinator
            .send_json(ApiRequest::get(format!("/subreddits/{id}")))
            .await
    }

    #[instrument(skip(self))]
    pub async fn join_subreddit(&self, id: i64) -> Result<(), ClientError> {
        self.coordinator
            .send_empty(ApiRequest::post(format!("/subreddits/{id}/join")))
            .await
    }

    // --- Votes ---

    /// Set the caller's vote on a post or comment. `None` removes it.
    ///
    /// The response carries the server's score and vote, which callers should
    /// adopt through [`VoteState::reconcile`](crate::api::votes::VoteState::reconcile).
    #[instrument(skip(self))]
    pub async fn vote(
        &self,
        target_type: TargetType,
        target_id: i64,
        vote_type: Option<VoteType>,
    ) -> Result<VoteResponse, ClientError> {
        let path = format!("/{}/{target_id}/vote", target_type.collection());
        let request = ApiRequest::post(path).json(&VoteRequest { vote_type })?;
        self.coordinator.send_json(request).await
    }

    // --- Search & users ---

    #[instrument(skip(self))]
    pub async fn search(&self, query: &str, page: &PageRequest) -> Result<SearchResults, ClientError> {
        let request = page.apply(ApiRequest::get("/search").query("q", query));
        self.coordinator.send_json(request).await
    }

    #[instrument(skip(self))]
    pub async fn current_user(&self) -> Result<UserProfile, ClientError> {
        self.coordinator.send_json(ApiRequest::get("/users/me")).await
    }

    // --- Admin ---

    #[instrument(skip(self, ban))]
    pub async fn ban_user(&self, username: &str, ban: &BanRequest) -> Result<(), ClientError> {
        let request = ApiRequest::post(format!("/admin/users/{username}/ban")).json(ban)?;
        self.coordinator.send_empty(request).await
    }

    #[instrument(skip(self))]
    pub async fn remove_post(&self, id: i64) -> Result<(), ClientError> {
        self.coordinator
            .send_empty(ApiRequest::delete(format!("/admin/posts/{id}")))
            .await
    }
}
