//! Change-feed queries.
//!
//! One call fetches **one page** of the feed; the delta loop in
//! `nimbus-vfs` persists the returned link after each applied batch so a
//! restart resumes mid-feed instead of re-walking the drive.

use nimbus_core::domain::ids::DeltaLink;
use nimbus_core::ports::remote::{DeltaPage, RemoteError};
use tracing::debug;

use crate::client::DriveClient;
use crate::wire::CollectionWire;

/// Path for the initial delta enumeration.
const DELTA_PATH: &str = "/me/drive/root/delta";

/// Fetches one page of the change feed.
///
/// `link` is either absent (start a full enumeration), a `nextLink`
/// (continue the current batch), or a stored `deltaLink` (poll for new
/// changes). All three are opaque absolute URLs except the initial case.
pub async fn delta(
    client: &DriveClient,
    link: Option<&DeltaLink>,
) -> Result<DeltaPage, RemoteError> {
    let url = match link {
        Some(l) => l.as_str().to_string(),
        None => client.url(DELTA_PATH),
    };

    let response = client
        .execute("delta", |c, token| c.get(&url).bearer_auth(token))
        .await?;
    let page: CollectionWire = DriveClient::read_json("delta", response).await?;

    let mut items = Vec::with_capacity(page.value.len());
    for wire in page.value {
        items.push(wire.into_remote_item()?);
    }

    debug!(
        count = items.len(),
        has_next = page.next_link.is_some(),
        has_delta = page.delta_link.is_some(),
        "delta page fetched"
    );

    Ok(DeltaPage {
        items,
        next_link: page.next_link,
        delta_link: page.delta_link.map(DeltaLink::new),
    })
}
