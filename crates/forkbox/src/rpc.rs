// SPDX-License-Identifier: GPL-3.0

//! JSON-RPC client for talking to forked nodes.
//!
//! The client is stateless apart from a request-id counter shared between clones. Every call
//! is raced against a timeout; a call that loses the race fails with [`RpcTimeoutError`] and
//! may still have been applied by the node.
//!
//! [`RpcClient::wait_until_ready`] is the only place that retries. It polls at a fixed
//! interval through a [`Sleeper`], which tests replace to control time.

use crate::{
	error::rpc::{INTERNAL_ERROR_CODE, RpcClientError, RpcError, RpcTimeoutError},
	strings::rpc::{JSONRPC_VERSION, methods},
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::{
	fmt::Debug,
	sync::{
		Arc,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Suspends the current task between readiness probes.
#[async_trait]
pub trait Sleeper: Debug + Send + Sync {
	/// Sleeps for `duration`.
	async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
	async fn sleep(&self, duration: Duration) {
		tokio::time::sleep(duration).await;
	}
}

/// JSON-RPC 2.0 over HTTP client.
///
/// # Example
///
/// ```ignore
/// use forkbox::RpcClient;
/// use std::time::Duration;
///
/// let client = RpcClient::new(Duration::from_secs(5));
/// client.wait_until_ready("http://127.0.0.1:8545", 50, Duration::from_millis(200)).await?;
/// let snapshot: String = client.request("http://127.0.0.1:8545", "evm_snapshot", json!([])).await?;
/// ```
#[derive(Clone, Debug)]
pub struct RpcClient {
	http: reqwest::Client,
	next_id: Arc<AtomicU64>,
	timeout: Duration,
	sleeper: Arc<dyn Sleeper>,
}

impl RpcClient {
	/// Creates a client whose calls time out after `timeout` unless told otherwise.
	pub fn new(timeout: Duration) -> Self {
		Self {
			http: reqwest::Client::new(),
			next_id: Arc::new(AtomicU64::new(1)),
			timeout,
			sleeper: Arc::new(TokioSleeper),
		}
	}

	/// Replaces the sleeper used between readiness probes.
	pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
		self.sleeper = sleeper;
		self
	}

	/// The default per-call timeout.
	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Sends `method` to `url` and returns its `result`.
	///
	/// # Arguments
	/// * `url` - The HTTP endpoint of the node.
	/// * `method` - The JSON-RPC method.
	/// * `params` - The request parameters, usually an array.
	/// * `timeout` - How long to wait for a response.
	pub async fn call(
		&self,
		url: &str,
		method: &str,
		params: Value,
		timeout: Duration,
	) -> Result<Value, RpcClientError> {
		match tokio::time::timeout(timeout, self.send(url, method, params)).await {
			Ok(result) => Ok(result?),
			Err(_) => {
				log::warn!("RPC request `{method}` to {url} timed out after {timeout:?}");
				Err(RpcTimeoutError {
					method: method.to_string(),
					timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
				}
				.into())
			},
		}
	}

	/// Like [`RpcClient::call`], but also gives up when `cancel` fires.
	///
	/// A cancelled request may still reach the node.
	pub async fn call_with_cancel(
		&self,
		url: &str,
		method: &str,
		params: Value,
		timeout: Duration,
		cancel: &CancellationToken,
	) -> Result<Value, RpcClientError> {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				log::debug!("RPC request `{method}` to {url} cancelled");
				Err(RpcClientError::Cancelled { method: method.to_string() })
			},
			result = self.call(url, method, params, timeout) => result,
		}
	}

	/// Sends `method` with the default timeout and decodes the result as `T`.
	pub async fn request<T: DeserializeOwned>(
		&self,
		url: &str,
		method: &str,
		params: Value,
	) -> Result<T, RpcClientError> {
		let value = self.call(url, method, params, self.timeout).await?;
		serde_json::from_value(value).map_err(|e| {
			RpcError::InvalidResponse { method: method.to_string(), message: e.to_string() }
				.into()
		})
	}

	/// Fetches a hex quantity result such as a block number or chain id.
	pub async fn quantity(&self, url: &str, method: &str) -> Result<u64, RpcClientError> {
		let raw: String = self.request(url, method, json!([])).await?;
		parse_quantity(&raw).ok_or_else(|| {
			RpcError::InvalidResponse {
				method: method.to_string(),
				message: format!("`{raw}` is not a hex quantity"),
			}
			.into()
		})
	}

	/// The current block height of the node at `url`.
	pub async fn block_number(&self, url: &str) -> Result<u64, RpcClientError> {
		self.quantity(url, methods::ETH_BLOCK_NUMBER).await
	}

	/// The chain id reported by the node at `url`.
	pub async fn chain_id(&self, url: &str) -> Result<u64, RpcClientError> {
		self.quantity(url, methods::ETH_CHAIN_ID).await
	}

	/// Whether the node at `url` answers a chain id query. Never fails.
	pub async fn is_ready(&self, url: &str) -> bool {
		self.call(url, methods::ETH_CHAIN_ID, json!([]), self.timeout).await.is_ok()
	}

	/// Polls [`RpcClient::is_ready`] up to `max_attempts` times, `interval` apart.
	pub async fn wait_until_ready(
		&self,
		url: &str,
		max_attempts: u32,
		interval: Duration,
	) -> Result<(), RpcClientError> {
		for attempt in 1..=max_attempts {
			if self.is_ready(url).await {
				log::debug!("{url} ready after {attempt} attempt(s)");
				return Ok(());
			}
			if attempt < max_attempts {
				self.sleeper.sleep(interval).await;
			}
		}
		Err(RpcClientError::NotReady { url: url.to_string(), attempts: max_attempts })
	}

	async fn send(&self, url: &str, method: &str, params: Value) -> Result<Value, RpcError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let body = json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "method": method, "params": params });
		log::debug!("RPC #{id} `{method}` -> {url}");

		let transport = |e: reqwest::Error| RpcError::Transport {
			url: url.to_string(),
			method: method.to_string(),
			message: e.to_string(),
		};
		let response = self.http.post(url).json(&body).send().await.map_err(transport)?;
		let status = response.status();
		if !status.is_success() {
			return Err(RpcError::Http {
				url: url.to_string(),
				method: method.to_string(),
				status: status.as_u16(),
			});
		}
		let text = response.text().await.map_err(transport)?;
		let invalid = |message: String| RpcError::InvalidResponse { method: method.to_string(), message };

		let mut response: Value = serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;
		let Some(object) = response.as_object_mut() else {
			return Err(invalid("response is not a JSON object".to_string()));
		};
		match object.remove("error") {
			None | Some(Value::Null) => {},
			Some(error) => {
				return Err(RpcError::Protocol {
					method: method.to_string(),
					code: error.get("code").and_then(Value::as_i64).unwrap_or(INTERNAL_ERROR_CODE),
					message: error
						.get("message")
						.and_then(Value::as_str)
						.unwrap_or_default()
						.to_string(),
					data: error.get("data").cloned(),
				});
			},
		}
		object.remove("result").ok_or_else(|| RpcError::MissingResult { method: method.to_string() })
	}
}

/// Parses a `0x`-prefixed hex quantity.
pub fn parse_quantity(raw: &str) -> Option<u64> {
	let digits = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))?;
	if digits.is_empty() {
		return None;
	}
	u64::from_str_radix(digits, 16).ok()
}
