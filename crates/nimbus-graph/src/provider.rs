//! [`CloudProvider`] implementation over the Graph client.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::config::NetworkConfig;
use nimbus_core::domain::ids::{DeltaLink, ItemId};
use nimbus_core::ports::remote::{
    ChildrenPage, ChunkOutcome, CloudProvider, DeltaPage, MetadataPatch, RemoteError, RemoteItem,
    SessionHandle, TokenSource,
};

use crate::client::DriveClient;
use crate::wire::ProfileWire;
use crate::{content, delta, items, upload};

/// The OneDrive drive, spoken through Microsoft Graph.
pub struct GraphProvider {
    client: DriveClient,
}

impl GraphProvider {
    pub fn new(tokens: Arc<dyn TokenSource>, config: NetworkConfig) -> Self {
        Self {
            client: DriveClient::new(tokens, config),
        }
    }

    /// Provider against a custom endpoint (wiremock tests).
    pub fn with_base_url(
        tokens: Arc<dyn TokenSource>,
        config: NetworkConfig,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: DriveClient::with_base_url(tokens, config, base_url),
        }
    }

    pub fn client(&self) -> &DriveClient {
        &self.client
    }
}

#[async_trait]
impl CloudProvider for GraphProvider {
    async fn get_item(&self, id: &ItemId) -> Result<RemoteItem, RemoteError> {
        items::get_item(&self.client, id).await
    }

    async fn get_item_by_path(&self, path: &str) -> Result<RemoteItem, RemoteError> {
        items::get_item_by_path(&self.client, path).await
    }

    async fn list_children(
        &self,
        id: &ItemId,
        page_token: Option<&str>,
    ) -> Result<ChildrenPage, RemoteError> {
        items::list_children(&self.client, id, page_token).await
    }

    async fn get_content(
        &self,
        id: &ItemId,
        range: Option<Range<u64>>,
    ) -> Result<Vec<u8>, RemoteError> {
        content::get_content(&self.client, id, range).await
    }

    async fn put_small(&self, id: &ItemId, bytes: &[u8]) -> Result<RemoteItem, RemoteError> {
        content::put_small(&self.client, id, bytes).await
    }

    async fn put_small_new(
        &self,
        parent: &ItemId,
        name: &str,
        bytes: &[u8],
    ) -> Result<RemoteItem, RemoteError> {
        content::put_small_new(&self.client, parent, name, bytes).await
    }

    async fn create_upload_session(&self, id: &ItemId) -> Result<SessionHandle, RemoteError> {
        upload::create_session(&self.client, id).await
    }

    async fn create_upload_session_new(
        &self,
        parent: &ItemId,
        name: &str,
    ) -> Result<SessionHandle, RemoteError> {
        upload::create_session_new(&self.client, parent, name).await
    }

    async fn put_chunk(
        &self,
        session: &SessionHandle,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome, RemoteError> {
        upload::put_chunk(&self.client, session, offset, total, bytes).await
    }

    async fn session_status(&self, session: &SessionHandle) -> Result<u64, RemoteError> {
        upload::session_status(&self.client, session).await
    }

    async fn create_folder(
        &self,
        parent: &ItemId,
        name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        items::create_folder(&self.client, parent, name).await
    }

    async fn patch_metadata(
        &self,
        id: &ItemId,
        patch: &MetadataPatch,
    ) -> Result<RemoteItem, RemoteError> {
        items::patch_metadata(&self.client, id, patch).await
    }

    async fn delete_item(&self, id: &ItemId) -> Result<(), RemoteError> {
        items::delete_item(&self.client, id).await
    }

    async fn delta(&self, link: Option<&DeltaLink>) -> Result<DeltaPage, RemoteError> {
        delta::delta(&self.client, link).await
    }

    async fn principal_name(&self) -> Result<String, RemoteError> {
        let url = self.client.url("/me");
        let response = self
            .client
            .execute("principal_name", |c, token| c.get(&url).bearer_auth(token))
            .await?;
        let profile: ProfileWire = DriveClient::read_json("principal_name", response).await?;
        Ok(profile.principal())
    }
}
