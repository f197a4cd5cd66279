//! JSON-RPC access to the chain node.
//!
//! Request/response calls go over HTTP through the `starknet` provider; the
//! WebSocket subscription endpoint is derived from the same configured URL.
//! A scheme-less host is assumed to be plain HTTP, matching how node hosts
//! are usually configured.

use anyhow::{bail, Context, Result};
use starknet::core::types::{BlockId, BlockTag, EventFilter, EventsPage, Felt};
use starknet::providers::jsonrpc::{HttpTransport, JsonRpcClient};
use starknet::providers::Provider;
use url::Url;

use crate::abi::ContractAbi;

/// Events fetched per `starknet_getEvents` request.
pub const EVENT_CHUNK_SIZE: u64 = 1000;

/// Coerces a configured node URL to its HTTP form (`ws → http`, `wss → https`).
pub fn http_url(raw: &str) -> Result<Url> {
    let mut url = parse_node_url(raw)?;
    let scheme = match url.scheme() {
        "http" | "https" => return Ok(url),
        "ws" => "http",
        "wss" => "https",
        other => bail!("unsupported RPC URL scheme `{other}` in {raw}"),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow::anyhow!("cannot coerce scheme of {raw}"))?;
    Ok(url)
}

/// Coerces a configured node URL to its WebSocket form (`http → ws`, `https → wss`).
pub fn ws_url(raw: &str) -> Result<Url> {
    let mut url = parse_node_url(raw)?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => bail!("unsupported RPC URL scheme `{other}` in {raw}"),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow::anyhow!("cannot coerce scheme of {raw}"))?;
    Ok(url)
}

fn parse_node_url(raw: &str) -> Result<Url> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    Url::parse(&candidate).with_context(|| format!("invalid RPC URL: {raw}"))
}

/// Thin client over the node's JSON-RPC surface.
///
/// The client does not retry; transient-failure policy belongs to the
/// ingestion loops that call it. JSON-RPC error objects surface verbatim
/// through the underlying provider error.
pub struct ChainProvider {
    client: JsonRpcClient<HttpTransport>,
    http: Url,
    ws: Url,
}

impl ChainProvider {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let http = http_url(rpc_url)?;
        let ws = ws_url(rpc_url)?;
        let client = JsonRpcClient::new(HttpTransport::new(http.clone()));
        Ok(Self { client, http, ws })
    }

    /// The HTTP endpoint used for request/response calls.
    pub fn http_endpoint(&self) -> &Url {
        &self.http
    }

    /// The WebSocket endpoint used for event subscriptions.
    pub fn ws_endpoint(&self) -> &Url {
        &self.ws
    }

    /// `starknet_blockNumber`.
    pub async fn latest_block(&self) -> Result<u64> {
        self.client
            .block_number()
            .await
            .context("starknet_blockNumber failed")
    }

    /// `starknet_getEvents` over an inclusive block range, one chunk at a
    /// time. Pass the returned continuation token back in to fetch the next
    /// chunk.
    pub async fn get_events(
        &self,
        from_block: u64,
        to_block: u64,
        address: Option<Felt>,
        keys: Option<Vec<Vec<Felt>>>,
        continuation_token: Option<String>,
    ) -> Result<EventsPage> {
        let filter = EventFilter {
            from_block: Some(BlockId::Number(from_block)),
            to_block: Some(BlockId::Number(to_block)),
            address,
            keys,
        };
        self.client
            .get_events(filter, continuation_token, EVENT_CHUNK_SIZE)
            .await
            .with_context(|| format!("starknet_getEvents failed for blocks {from_block}-{to_block}"))
    }

    /// `starknet_getClassAt` against the latest block, parsed down to the ABI.
    pub async fn class_at(&self, address: Felt) -> Result<ContractAbi> {
        let class = self
            .client
            .get_class_at(BlockId::Tag(BlockTag::Latest), address)
            .await
            .with_context(|| format!("starknet_getClassAt failed for {address:#x}"))?;
        ContractAbi::from_contract_class(&class)
            .with_context(|| format!("contract {address:#x} has no decodable ABI"))
    }
}
