//! Production [`KvBackend`] over a real etcd cluster.

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};

use crate::error::{KvError, KvResult};

use super::KvBackend;

/// Thin wrapper around [`etcd_client::Client`] implementing the
/// compare-and-swap + TTL primitives the core needs.
pub struct EtcdBackend {
    client: Client,
}

impl EtcdBackend {
    /// Connects to the etcd endpoint named in configuration
    /// (`etcd.host`, a single `host:port` pair).
    pub async fn connect(host: &str) -> KvResult<Self> {
        let endpoint = format!("http://{host}");
        let client = Client::connect([endpoint], None)
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    async fn lease_for_ttl(&self, ttl: Option<u64>) -> KvResult<Option<i64>> {
        match ttl {
            None => Ok(None),
            Some(ttl) => {
                let resp = self
                    .client
                    .clone()
                    .lease_grant(ttl as i64, None)
                    .await
                    .map_err(|e| KvError::Transport(e.to_string()))?;
                Ok(Some(resp.id()))
            }
        }
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn get(&self, path: &str) -> KvResult<Option<String>> {
        let resp = self
            .client
            .clone()
            .get(path, None)
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;

        match resp.kvs().first() {
            Some(kv) => {
                let value = kv
                    .value_str()
                    .map_err(|e| KvError::Transport(e.to_string()))?
                    .to_string();
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn list_children(&self, prefix: &str) -> KvResult<Vec<(String, String)>> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;

        let mut out = Vec::new();
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .map_err(|e| KvError::Transport(e.to_string()))?;
            let leaf = key.rsplit('/').next().unwrap_or(key).to_string();
            let value = kv
                .value_str()
                .map_err(|e| KvError::Transport(e.to_string()))?
                .to_string();
            out.push((leaf, value));
        }
        Ok(out)
    }

    async fn put(&self, path: &str, value: &str, ttl: Option<u64>) -> KvResult<()> {
        let lease_id = self.lease_for_ttl(ttl).await?;
        let mut opts = PutOptions::new();
        if let Some(id) = lease_id {
            opts = opts.with_lease(id);
        }

        self.client
            .clone()
            .put(path, value, Some(opts))
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> KvResult<()> {
        self.client
            .clone()
            .delete(path, None)
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn put_if_absent(&self, path: &str, value: &str, ttl: Option<u64>) -> KvResult<bool> {
        let lease_id = self.lease_for_ttl(ttl).await?;
        let mut put_opts = PutOptions::new();
        if let Some(id) = lease_id {
            put_opts = put_opts.with_lease(id);
        }

        let txn = Txn::new()
            .when(vec![Compare::version(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(path, value, Some(put_opts))]);

        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(resp.succeeded())
    }

    async fn put_if_value(
        &self,
        path: &str,
        value: &str,
        prev_value: &str,
        ttl: Option<u64>,
    ) -> KvResult<bool> {
        let lease_id = self.lease_for_ttl(ttl).await?;
        let mut put_opts = PutOptions::new();
        if let Some(id) = lease_id {
            put_opts = put_opts.with_lease(id);
        }

        let txn = Txn::new()
            .when(vec![Compare::value(path, CompareOp::Equal, prev_value)])
            .and_then(vec![TxnOp::put(path, value, Some(put_opts))]);

        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(resp.succeeded())
    }

    async fn delete_if_value(&self, path: &str, prev_value: &str) -> KvResult<bool> {
        let txn = Txn::new()
            .when(vec![Compare::value(path, CompareOp::Equal, prev_value)])
            .and_then(vec![TxnOp::delete(path, None)]);

        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .map_err(|e| KvError::Transport(e.to_string()))?;
        Ok(resp.succeeded())
    }
}
