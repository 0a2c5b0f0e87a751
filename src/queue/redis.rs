use std::time::Duration;

use fred::interfaces::{ClientLike, KeysInterface, ListInterface};
use fred::types::{Expiration, RedisConfig, SetOptions};

use super::{ListStore, ListStoreError};
use crate::config::RedisConfig as RedisListStoreConfig;

#[derive(Debug)]
pub struct RedisListStore {
	client: fred::clients::RedisClient,
}

#[derive(Debug, thiserror::Error)]
pub enum RedisListStoreError {
	#[error("redis: {0}")]
	Redis(#[from] fred::error::RedisError),
}

impl RedisListStore {
	#[tracing::instrument(skip(config), name = "RedisListStore::new", err)]
	pub async fn new(config: &RedisListStoreConfig) -> Result<Self, RedisListStoreError> {
		let client = fred::clients::RedisClient::new(RedisConfig::from_url(&config.url())?, None, None, None);

		client.connect();
		client.wait_for_connect().await?;

		Ok(Self { client })
	}
}

impl ListStore for RedisListStore {
	async fn lpush(&self, key: &str, value: String) -> Result<(), ListStoreError> {
		self.client
			.lpush::<(), _, _>(key, value)
			.await
			.map_err(RedisListStoreError::from)?;
		Ok(())
	}

	async fn rpush(&self, key: &str, value: String) -> Result<(), ListStoreError> {
		self.client
			.rpush::<(), _, _>(key, value)
			.await
			.map_err(RedisListStoreError::from)?;
		Ok(())
	}

	async fn rpop(&self, key: &str) -> Result<Option<String>, ListStoreError> {
		Ok(self
			.client
			.rpop::<Option<String>, _>(key, None)
			.await
			.map_err(RedisListStoreError::from)?)
	}

	async fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<(String, String)>, ListStoreError> {
		let keys: Vec<String> = keys.iter().map(|key| (*key).to_owned()).collect();
		Ok(self
			.client
			.brpop::<Option<(String, String)>, _>(keys, timeout.as_secs_f64())
			.await
			.map_err(RedisListStoreError::from)?)
	}

	async fn llen(&self, key: &str) -> Result<u64, ListStoreError> {
		Ok(self.client.llen::<u64, _>(key).await.map_err(RedisListStoreError::from)?)
	}

	async fn lrange(&self, key: &str, offset: usize, limit: usize) -> Result<Vec<String>, ListStoreError> {
		if limit == 0 {
			return Ok(Vec::new());
		}

		let start = offset as i64;
		let stop = (offset + limit - 1) as i64;
		Ok(self
			.client
			.lrange::<Vec<String>, _>(key, start, stop)
			.await
			.map_err(RedisListStoreError::from)?)
	}

	async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, ListStoreError> {
		let acquired: Option<String> = self
			.client
			.set(
				key,
				value,
				Some(Expiration::EX(ttl.as_secs().max(1) as i64)),
				Some(SetOptions::NX),
				false,
			)
			.await
			.map_err(RedisListStoreError::from)?;
		Ok(acquired.is_some())
	}

	async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ListStoreError> {
		self.client
			.expire::<(), _>(key, ttl.as_secs().max(1) as i64)
			.await
			.map_err(RedisListStoreError::from)?;
		Ok(())
	}

	async fn del(&self, key: &str) -> Result<(), ListStoreError> {
		self.client.del::<(), _>(key).await.map_err(RedisListStoreError::from)?;
		Ok(())
	}

	async fn healthy(&self) -> bool {
		self.client.ping::<()>().await.is_ok()
	}
}
