//! Message pagination.

use chatsync_core::{Page, PageMerge, PaginationCursorTracker, PaginationParameter};
use chatsync_types::{ChannelId, MessageId, MessagePayload};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use crate::api::{decode, ApiClient, Endpoint, MessagesResponse};
use crate::error::ClientError;
use crate::store::Store;

/// A loaded page of messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePage {
    /// Messages, oldest first
    pub messages: Vec<MessagePayload>,
    /// How the page combines with the loaded messages
    pub merge: PageMerge,
    /// Nothing older is left to load
    pub has_loaded_all_older: bool,
    /// Nothing newer is left to load
    pub has_loaded_all_newer: bool,
}

/// Loads message pages per channel, keeping a cursor for each.
///
/// A page is only accepted when it closes the bracket opened for it. If a
/// newer request was started for the same channel meanwhile, the older
/// response fails with [`ClientError::Cursor`] and is not persisted.
pub struct MessagePaginator<S> {
    api: Arc<dyn ApiClient>,
    store: Arc<S>,
    cursors: DashMap<ChannelId, PaginationCursorTracker<MessageId>>,
    page_size: usize,
}

impl<S: Store> MessagePaginator<S> {
    /// Create a paginator loading `page_size` messages per request.
    pub fn new(api: Arc<dyn ApiClient>, store: Arc<S>, page_size: usize) -> Self {
        Self {
            api,
            store,
            cursors: DashMap::new(),
            page_size,
        }
    }

    /// Load a page of `cid`.
    ///
    /// `None` loads the newest page.
    pub async fn load(
        &self,
        cid: &ChannelId,
        pagination: Option<PaginationParameter<MessageId>>,
    ) -> Result<MessagePage, ClientError> {
        self.cursors
            .entry(cid.clone())
            .or_default()
            .begin(pagination.clone());

        let endpoint = Endpoint::messages(cid, pagination.as_ref(), self.page_size);
        let result = match self.api.request(endpoint).await {
            Ok(body) => decode::<MessagesResponse>(body)
                .map(|response| response.messages)
                .map_err(ClientError::from),
            Err(e) => Err(ClientError::from(e)),
        };

        let page = result.as_ref().map(|messages| {
            Page::new(
                messages.iter().map(|m| m.id.clone()).collect(),
                self.page_size,
            )
        });
        let (merge, has_loaded_all_older, has_loaded_all_newer) = {
            let mut cursor = self.cursors.entry(cid.clone()).or_default();
            let merge = cursor.end(pagination.as_ref(), &page).map_err(|e| {
                tracing::debug!("Discarding message page for {}: {}", cid, e);
                e
            })?;
            (
                merge,
                cursor.has_loaded_all_older(),
                cursor.has_loaded_all_newer(),
            )
        };

        let messages = result?;
        let stored = messages.clone();
        let owner = cid.clone();
        self.store
            .write_session(move |session| {
                for message in stored {
                    session.save_message(&owner, message)?;
                }
                Ok(())
            })
            .await?;

        Ok(MessagePage {
            messages,
            merge: merge.unwrap_or(PageMerge::Replace),
            has_loaded_all_older,
            has_loaded_all_newer,
        })
    }

    /// Load the page before the oldest loaded message.
    ///
    /// Loads the newest page when nothing is loaded yet.
    pub async fn load_older(&self, cid: &ChannelId) -> Result<MessagePage, ClientError> {
        let pagination = self.cursors.get(cid).and_then(|c| c.next_older());
        self.load(cid, pagination).await
    }

    /// Load the page after the newest loaded message.
    pub async fn load_newer(&self, cid: &ChannelId) -> Result<MessagePage, ClientError> {
        let pagination = self.cursors.get(cid).and_then(|c| c.next_newer());
        self.load(cid, pagination).await
    }

    /// Oldest and newest loaded message of `cid`.
    pub fn loaded_range(&self, cid: &ChannelId) -> Option<(Option<MessageId>, Option<MessageId>)> {
        self.cursors
            .get(cid)
            .map(|c| (c.oldest().cloned(), c.newest().cloned()))
    }

    /// Whether a page of `cid` is loading.
    pub fn is_loading(&self, cid: &ChannelId) -> bool {
        self.cursors.get(cid).is_some_and(|c| c.is_loading())
    }

    /// Forget the cursor of `cid`.
    pub fn reset(&self, cid: &ChannelId) {
        self.cursors.remove(cid);
    }
}

impl<S> fmt::Debug for MessagePaginator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePaginator")
            .field("channels", &self.cursors.len())
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, MockApiClient};
    use crate::store::{MemoryStore, ReadSession};
    use chatsync_core::CursorError;
    use chatsync_types::ChannelSnapshot;
    use serde_json::json;
    use std::time::Duration;

    const PATH: &str = "channels/messaging/general/messages";

    fn cid() -> ChannelId {
        "messaging:general".parse().unwrap()
    }

    fn messages(ids: &[(&str, u64)]) -> serde_json::Value {
        json!({
            "messages": ids
                .iter()
                .map(|(id, at)| json!({ "id": id, "text": "", "user": { "id": "bob" }, "created_at": at }))
                .collect::<Vec<_>>()
        })
    }

    async fn setup(page_size: usize) -> (MockApiClient, Arc<MemoryStore>, Arc<MessagePaginator<MemoryStore>>) {
        let api = MockApiClient::new();
        let store = Arc::new(MemoryStore::new());
        store
            .write_session(|s| {
                s.save_channel(ChannelSnapshot::new(cid(), 1));
                Ok(())
            })
            .await
            .unwrap();
        let paginator = Arc::new(MessagePaginator::new(
            Arc::new(api.clone()),
            Arc::clone(&store),
            page_size,
        ));
        (api, store, paginator)
    }

    // ===========================================
    // Pages
    // ===========================================

    #[tokio::test]
    async fn first_page_replaces_and_older_pages_prepend() {
        let (api, store, paginator) = setup(2).await;
        api.respond(PATH, messages(&[("m3", 30), ("m4", 40)]));
        api.respond(PATH, messages(&[("m2", 20)]));

        let first = paginator.load(&cid(), None).await.unwrap();
        assert_eq!(first.merge, PageMerge::Replace);
        assert!(first.has_loaded_all_newer);
        assert!(!first.has_loaded_all_older);

        let older = paginator.load_older(&cid()).await.unwrap();
        assert_eq!(older.merge, PageMerge::PrependOlder);
        assert!(older.has_loaded_all_older);
        assert!(api.requests_to(PATH)[1]
            .endpoint
            .query
            .contains(&("id_lt".into(), "m3".into())));

        assert_eq!(
            paginator.loaded_range(&cid()),
            Some((Some(MessageId::new("m2")), Some(MessageId::new("m4"))))
        );
        assert_eq!(store.read(|s| s.messages(&cid()).len()), 3);
    }

    #[tokio::test]
    async fn failed_load_closes_the_bracket() {
        let (api, _store, paginator) = setup(2).await;
        api.fail(PATH, ApiError::Network("offline".into()));

        let result = paginator.load(&cid(), None).await;
        assert!(matches!(result, Err(ClientError::Api(ApiError::Network(_)))));
        assert!(!paginator.is_loading(&cid()));
    }

    #[tokio::test]
    async fn superseded_page_is_rejected_without_touching_the_cursor() {
        let (api, store, paginator) = setup(2).await;
        api.respond(PATH, messages(&[("m3", 30), ("m4", 40)]));
        paginator.load(&cid(), None).await.unwrap();

        // Older page request held in flight
        api.respond(PATH, messages(&[("m1", 10), ("m2", 20)]));
        api.pause();
        let stale = {
            let paginator = Arc::clone(&paginator);
            tokio::spawn(async move { paginator.load_older(&cid()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A jump to a specific message opens a new bracket
        api.respond(PATH, messages(&[("m9", 90)]));
        let jump = {
            let paginator = Arc::clone(&paginator);
            tokio::spawn(async move {
                paginator
                    .load(&cid(), Some(PaginationParameter::Around(MessageId::new("m9"))))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        api.resume();

        let stale = stale.await.unwrap();
        assert!(matches!(
            stale,
            Err(ClientError::Cursor(CursorError::Mismatch { .. }))
        ));

        // Responses may be served in either order; only the jump counts
        let jump = jump.await.unwrap().unwrap();
        assert_eq!(jump.merge, PageMerge::Replace);
        let first = jump.messages.first().map(|m| m.id.clone());
        let last = jump.messages.last().map(|m| m.id.clone());
        assert_eq!(paginator.loaded_range(&cid()), Some((first, last)));
        assert_eq!(
            store.read(|s| s.messages(&cid()).len()),
            2 + jump.messages.len()
        );
    }

    #[tokio::test]
    async fn reset_forgets_the_cursor() {
        let (api, _store, paginator) = setup(2).await;
        api.respond(PATH, messages(&[("m1", 10)]));
        paginator.load(&cid(), None).await.unwrap();

        paginator.reset(&cid());
        assert_eq!(paginator.loaded_range(&cid()), None);
    }
}
