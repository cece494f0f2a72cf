use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tracing::{debug, error};

pub mod model;

pub use model::{Author, Label, MergeRequest, MergeRequestState};

/// Default page size for list calls; GitLab caps `per_page` at 100.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum GitlabError {
    #[error("failed to reach GitLab: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("received 429 from GitLab: {0}")]
    RateLimited(String),
    #[error("gitlab error {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid GitLab URL: {0}")]
    Url(String),
    #[error(transparent)]
    Window(#[from] WindowError),
}

impl GitlabError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GitlabError::RateLimited(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    #[error("since must be earlier than until")]
    InvertedRange,
    #[error("invalid `{param}` timestamp {value:?}: expected RFC 3339")]
    InvalidTimestamp { param: &'static str, value: String },
}

/// Inclusive time window applied to the list call. Construction enforces
/// `since < until` before any network traffic happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    since: DateTime<Utc>,
    until: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Self, WindowError> {
        if since >= until {
            return Err(WindowError::InvertedRange);
        }
        Ok(Self { since, until })
    }

    /// Parse a window from strict RFC 3339 strings, naming the offending
    /// parameter on failure.
    pub fn parse(since: &str, until: &str) -> Result<Self, WindowError> {
        Self::new(parse_timestamp("since", since)?, parse_timestamp("until", until)?)
    }

    /// Window ending now and reaching `days` back. A non-positive `days`
    /// fails the same `since < until` check as any other window.
    pub fn last_days(days: i64) -> Result<Self, WindowError> {
        let until = Utc::now();
        Self::new(until - chrono::Duration::days(days), until)
    }

    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    pub fn until(&self) -> DateTime<Utc> {
        self.until
    }
}

fn parse_timestamp(param: &'static str, value: &str) -> Result<DateTime<Utc>, WindowError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| WindowError::InvalidTimestamp {
            param,
            value: value.to_owned(),
        })
}

/// Which dimension the list call filters on. An author filter may optionally
/// also scope to one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeRequestFilter {
    Project { id: String },
    Author {
        username: String,
        project: Option<String>,
    },
}

impl MergeRequestFilter {
    fn path(&self) -> String {
        match self {
            MergeRequestFilter::Project { id }
            | MergeRequestFilter::Author {
                project: Some(id), ..
            } => format!("api/v4/projects/{}/merge_requests", id),
            MergeRequestFilter::Author { project: None, .. } => {
                "api/v4/merge_requests".to_owned()
            }
        }
    }

    /// Project syncs window on last update; author syncs window on creation.
    fn window_field(&self) -> &'static str {
        match self {
            MergeRequestFilter::Project { .. } => "updated",
            MergeRequestFilter::Author { .. } => "created",
        }
    }

    fn apply_query(&self, url: &mut Url, window: &DateWindow, page: usize, per_page: usize) {
        let field = self.window_field();
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("state", "merged")
            .append_pair(&format!("{}_after", field), &window.since().to_rfc3339())
            .append_pair(&format!("{}_before", field), &window.until().to_rfc3339())
            .append_pair("order_by", &format!("{}_at", field))
            .append_pair("sort", "desc")
            .append_pair("per_page", &per_page.to_string())
            .append_pair("page", &page.to_string());
        if let MergeRequestFilter::Author { username, project } = self {
            pairs.append_pair("author_username", username);
            if project.is_none() {
                pairs.append_pair("scope", "all");
            }
        }
    }
}

/// Read side of the sync: lists merged merge requests for a filter and window.
/// Behind a trait so the engine can run against a fake in tests.
#[async_trait]
pub trait MergeRequestSource: Send + Sync {
    async fn list_merged(
        &self,
        filter: &MergeRequestFilter,
        window: &DateWindow,
        per_page: usize,
    ) -> Result<Vec<MergeRequest>, GitlabError>;
}

#[derive(Clone)]
pub struct GitlabClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for GitlabClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitlabClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GitlabClient {
    pub fn new(base_url: &str, token: String) -> Result<Self, GitlabError> {
        let base_url = Url::parse(base_url).map_err(|e| GitlabError::Url(e.to_string()))?;
        let http = Client::builder()
            .user_agent("gitlab-notion-sync/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn list_url(
        &self,
        filter: &MergeRequestFilter,
        window: &DateWindow,
        page: usize,
        per_page: usize,
    ) -> Result<Url, GitlabError> {
        let mut url = self
            .base_url
            .join(&filter.path())
            .map_err(|e| GitlabError::Url(e.to_string()))?;
        filter.apply_query(&mut url, window, page, per_page);
        Ok(url)
    }

    async fn fetch_page(
        &self,
        filter: &MergeRequestFilter,
        window: &DateWindow,
        page: usize,
        per_page: usize,
    ) -> Result<Vec<MergeRequest>, GitlabError> {
        let url = self.list_url(filter, window, page, per_page)?;
        debug!(%url, page, "fetching merge request page");
        let res = self
            .http
            .get(url)
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(GitlabError::RateLimited(body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(GitlabError::Api { status, body });
        }

        Ok(res.json::<Vec<MergeRequest>>().await?)
    }

    /// Fetch every page for the filter and window, concatenated. Records
    /// whose state is not `merged` are dropped regardless of what the
    /// server returned.
    pub async fn list_merged(
        &self,
        filter: &MergeRequestFilter,
        window: &DateWindow,
        per_page: usize,
    ) -> Result<Vec<MergeRequest>, GitlabError> {
        let pages = self.page_stream(filter.clone(), *window, per_page);
        match pages.try_concat().await {
            Ok(all) => Ok(all),
            Err(err) => {
                error!(
                    ?filter,
                    since = %window.since(),
                    until = %window.until(),
                    %err,
                    "failed to list merge requests"
                );
                Err(err)
            }
        }
    }

    /// Lazy page-by-page variant of [`list_merged`]. The stream is finite and
    /// non-restartable; it ends on the first short or empty page.
    pub fn page_stream(
        &self,
        filter: MergeRequestFilter,
        window: DateWindow,
        per_page: usize,
    ) -> impl Stream<Item = Result<Vec<MergeRequest>, GitlabError>> {
        let client = self.clone();
        paginate(
            move |page| {
                let client = client.clone();
                let filter = filter.clone();
                async move { client.fetch_page(&filter, &window, page, per_page).await }
            },
            per_page,
        )
    }
}

/// Drive `fetch` page by page starting at 1. A short page is still yielded
/// but ends the stream; an empty page ends it without yielding. Records
/// whose state is not `merged` are dropped from yielded pages, after the
/// raw page length decided whether to continue.
fn paginate<F, Fut>(
    fetch: F,
    per_page: usize,
) -> impl Stream<Item = Result<Vec<MergeRequest>, GitlabError>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<MergeRequest>, GitlabError>>,
{
    futures::stream::try_unfold((fetch, 1usize, false), move |(mut fetch, page, done)| async move {
        if done {
            return Ok(None);
        }
        let mut batch = fetch(page).await?;
        if batch.is_empty() {
            return Ok(None);
        }
        let last = batch.len() < per_page;
        batch.retain(|mr| mr.state == MergeRequestState::Merged);
        Ok(Some((batch, (fetch, page + 1, last))))
    })
}

#[async_trait]
impl MergeRequestSource for GitlabClient {
    async fn list_merged(
        &self,
        filter: &MergeRequestFilter,
        window: &DateWindow,
        per_page: usize,
    ) -> Result<Vec<MergeRequest>, GitlabError> {
        GitlabClient::list_merged(self, filter, window, per_page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn window() -> DateWindow {
        DateWindow::parse("2024-03-01T00:00:00Z", "2024-03-08T00:00:00Z").unwrap()
    }

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs().into_owned().collect()
    }

    #[test]
    fn rejects_inverted_range() {
        let err = DateWindow::parse("2024-03-08T00:00:00Z", "2024-03-01T00:00:00Z").unwrap_err();
        assert_eq!(err, WindowError::InvertedRange);
        assert_eq!(err.to_string(), "since must be earlier than until");
    }

    #[test]
    fn rejects_equal_bounds() {
        let ts = "2024-03-01T00:00:00Z";
        assert_eq!(DateWindow::parse(ts, ts).unwrap_err(), WindowError::InvertedRange);
    }

    #[test]
    fn malformed_since_names_parameter() {
        let err = DateWindow::parse("yesterday", "2024-03-08T00:00:00Z").unwrap_err();
        assert!(matches!(
            err,
            WindowError::InvalidTimestamp { param: "since", .. }
        ));
        assert!(err.to_string().contains("since"));
    }

    #[test]
    fn malformed_until_names_parameter() {
        let err = DateWindow::parse("2024-03-01T00:00:00Z", "03/08/2024").unwrap_err();
        assert!(matches!(
            err,
            WindowError::InvalidTimestamp { param: "until", .. }
        ));
    }

    #[test]
    fn last_days_window_is_valid() {
        let w = DateWindow::last_days(7).unwrap();
        assert!(w.since() < w.until());
        assert_eq!((w.until() - w.since()).num_days(), 7);
    }

    #[test]
    fn last_days_rejects_non_positive_lookback() {
        assert_eq!(DateWindow::last_days(0).unwrap_err(), WindowError::InvertedRange);
        assert_eq!(DateWindow::last_days(-3).unwrap_err(), WindowError::InvertedRange);
    }

    #[test]
    fn project_filter_windows_on_update_time() {
        let client = GitlabClient::new("https://gitlab.example.com", "token".into()).unwrap();
        let filter = MergeRequestFilter::Project { id: "42".into() };
        let url = client.list_url(&filter, &window(), 1, 50).unwrap();
        assert_eq!(url.path(), "/api/v4/projects/42/merge_requests");
        let q = query_map(&url);
        assert_eq!(q["state"], "merged");
        assert_eq!(q["order_by"], "updated_at");
        assert_eq!(q["sort"], "desc");
        assert_eq!(q["per_page"], "50");
        assert_eq!(q["page"], "1");
        assert!(q.contains_key("updated_after"));
        assert!(q.contains_key("updated_before"));
        assert!(!q.contains_key("created_after"));
    }

    #[test]
    fn author_filter_windows_on_creation_time() {
        let client = GitlabClient::new("https://gitlab.example.com", "token".into()).unwrap();
        let filter = MergeRequestFilter::Author {
            username: "jdoe".into(),
            project: None,
        };
        let url = client.list_url(&filter, &window(), 2, 100).unwrap();
        assert_eq!(url.path(), "/api/v4/merge_requests");
        let q = query_map(&url);
        assert_eq!(q["author_username"], "jdoe");
        assert_eq!(q["scope"], "all");
        assert_eq!(q["order_by"], "created_at");
        assert_eq!(q["page"], "2");
        assert!(q.contains_key("created_after"));
    }

    #[test]
    fn author_filter_scoped_to_project_uses_project_path() {
        let client = GitlabClient::new("https://gitlab.example.com", "token".into()).unwrap();
        let filter = MergeRequestFilter::Author {
            username: "jdoe".into(),
            project: Some("42".into()),
        };
        let url = client.list_url(&filter, &window(), 1, 100).unwrap();
        assert_eq!(url.path(), "/api/v4/projects/42/merge_requests");
        let q = query_map(&url);
        assert_eq!(q["author_username"], "jdoe");
        assert!(!q.contains_key("scope"));
    }

    #[test]
    fn rate_limit_error_is_classified() {
        assert!(GitlabError::RateLimited("slow down".into()).is_rate_limit());
        assert!(!GitlabError::Api {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: "boom".into()
        }
        .is_rate_limit());
    }

    mod pagination {
        use super::*;
        use crate::gitlab::model::Author;
        use chrono::TimeZone;
        use futures::StreamExt;
        use std::sync::{Arc, Mutex};

        fn mr(iid: i64, state: MergeRequestState) -> MergeRequest {
            MergeRequest {
                id: 1000 + iid,
                iid,
                title: format!("Change #{}", iid),
                description: None,
                state,
                author: Author {
                    id: 5,
                    name: "Jane Doe".into(),
                    username: "jdoe".into(),
                },
                source_branch: format!("feature/{}", iid),
                target_branch: "main".into(),
                created_at: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
                updated_at: Utc.with_ymd_and_hms(2024, 3, 2, 11, 0, 0).unwrap(),
                merged_at: None,
                closed_at: None,
                web_url: format!("https://gitlab.com/acme/app/-/merge_requests/{}", iid),
                labels: None,
            }
        }

        /// Serve canned pages (1-indexed) and record which pages were asked for.
        fn canned(
            pages: Vec<Vec<MergeRequest>>,
        ) -> (
            impl FnMut(usize) -> futures::future::Ready<Result<Vec<MergeRequest>, GitlabError>>,
            Arc<Mutex<Vec<usize>>>,
        ) {
            let served = Arc::new(Mutex::new(Vec::new()));
            let served_capture = Arc::clone(&served);
            let fetch = move |page: usize| {
                served_capture.lock().unwrap().push(page);
                futures::future::ready(Ok(pages.get(page - 1).cloned().unwrap_or_default()))
            };
            (fetch, served)
        }

        #[tokio::test]
        async fn short_page_is_yielded_then_ends_the_stream() {
            let (fetch, served) = canned(vec![
                vec![mr(1, MergeRequestState::Merged), mr(2, MergeRequestState::Merged)],
                vec![mr(3, MergeRequestState::Merged), mr(4, MergeRequestState::Merged)],
                vec![mr(5, MergeRequestState::Merged)],
            ]);

            let batches: Vec<Vec<MergeRequest>> =
                paginate(fetch, 2).try_collect().await.unwrap();

            assert_eq!(batches.len(), 3);
            assert_eq!(batches[2].len(), 1);
            assert_eq!(batches[2][0].iid, 5);
            // The short third page ends the stream; page 4 is never requested.
            assert_eq!(*served.lock().unwrap(), vec![1, 2, 3]);
        }

        #[tokio::test]
        async fn empty_first_page_yields_nothing() {
            let (fetch, served) = canned(Vec::new());

            let batches: Vec<Vec<MergeRequest>> =
                paginate(fetch, 2).try_collect().await.unwrap();

            assert!(batches.is_empty());
            assert_eq!(*served.lock().unwrap(), vec![1]);
        }

        #[tokio::test]
        async fn non_merged_records_are_dropped_from_yielded_pages() {
            // A full raw page keeps pagination going even when filtering
            // leaves fewer records behind.
            let (fetch, served) = canned(vec![vec![
                mr(1, MergeRequestState::Merged),
                mr(2, MergeRequestState::Opened),
            ]]);

            let batches: Vec<Vec<MergeRequest>> =
                paginate(fetch, 2).try_collect().await.unwrap();

            assert_eq!(batches.len(), 1);
            let iids: Vec<i64> = batches[0].iter().map(|mr| mr.iid).collect();
            assert_eq!(iids, vec![1]);
            assert_eq!(*served.lock().unwrap(), vec![1, 2]);
        }

        #[tokio::test]
        async fn pages_concatenate_in_order() {
            let (fetch, _) = canned(vec![
                vec![mr(1, MergeRequestState::Merged), mr(2, MergeRequestState::Merged)],
                vec![mr(3, MergeRequestState::Merged)],
            ]);

            let all: Vec<MergeRequest> = paginate(fetch, 2).try_concat().await.unwrap();

            let iids: Vec<i64> = all.iter().map(|mr| mr.iid).collect();
            assert_eq!(iids, vec![1, 2, 3]);
        }

        #[tokio::test]
        async fn mid_stream_error_surfaces_after_earlier_pages() {
            let calls = Arc::new(Mutex::new(0usize));
            let calls_capture = Arc::clone(&calls);
            let fetch = move |page: usize| {
                *calls_capture.lock().unwrap() += 1;
                futures::future::ready(if page == 1 {
                    Ok(vec![mr(1, MergeRequestState::Merged), mr(2, MergeRequestState::Merged)])
                } else {
                    Err(GitlabError::RateLimited("slow down".into()))
                })
            };

            let mut stream = Box::pin(paginate(fetch, 2));
            let first = stream.next().await.unwrap().unwrap();
            assert_eq!(first.len(), 2);
            let err = stream.next().await.unwrap().unwrap_err();
            assert!(err.is_rate_limit());
            assert!(stream.next().await.is_none());
            assert_eq!(*calls.lock().unwrap(), 2);
        }
    }
}
