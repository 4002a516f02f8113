//! etcd-backed coordination client.
//!
//! Maps the synchronous lock contract onto `etcd-client`: a lock is an
//! etcd lock key held under a granted lease; refreshing sends one
//! keep-alive ping; a peer process reconstructs the lock from the lease
//! via `lease_time_to_live(keys = true)`.

use std::time::Duration;

use etcd_client::{
    Client, Error as EtcdError, LeaseTimeToLiveOptions, LockOptions, PutOptions,
};
use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};

use super::{KvClient, KvConfig, KvError, Lease, LockHandle};

struct ClientState {
    pid: u32,
    runtime: Runtime,
    client: Client,
}

/// KV lock primitive over an etcd cluster.
///
/// RPCs run on a private current-thread runtime. The runtime and the
/// connected client are built lazily and tied to the pid that built
/// them, so a handle carried across `fork` reconnects in the child
/// instead of reusing the parent's runtime.
pub struct EtcdKvClient {
    config: KvConfig,
    state: Mutex<Option<ClientState>>,
}

fn transport(err: impl ToString) -> KvError {
    KvError::Transport { reason: err.to_string() }
}

impl EtcdKvClient {
    pub fn new(config: KvConfig) -> Self {
        Self { config, state: Mutex::new(None) }
    }

    fn with_client<T>(
        &self,
        f: impl FnOnce(&Runtime, &mut Client) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        let mut guard = self.state.lock();
        let pid = std::process::id();
        if guard.as_ref().map(|state| state.pid) != Some(pid) {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(transport)?;
            let endpoints = self.config.endpoints.clone();
            let connect = runtime.block_on(async {
                tokio::time::timeout(self.config.timeout(), Client::connect(endpoints, None)).await
            });
            let client = match connect {
                Ok(Ok(client)) => client,
                Ok(Err(err)) => return Err(transport(err)),
                Err(_) => return Err(transport("connect timed out")),
            };
            *guard = Some(ClientState { pid, runtime, client });
        }
        match guard.as_mut() {
            Some(state) => f(&state.runtime, &mut state.client),
            None => Err(transport("client unavailable")),
        }
    }
}

impl KvClient for EtcdKvClient {
    fn acquire(&self, key: &str, ttl: Duration, label: &str) -> Result<LockHandle, KvError> {
        let key = self.config.prefixed_key(key);
        let timeout = self.config.timeout();
        self.with_client(|runtime, client| {
            runtime.block_on(async {
                let grant = client
                    .lease_grant(ttl.as_secs() as i64, None)
                    .await
                    .map_err(|err: EtcdError| KvError::LockCreate { reason: err.to_string() })?;
                let lease_id = grant.id();

                // A held lock makes `lock` wait for the holder; bound the
                // wait by the RPC timeout and report the key as occupied.
                let locked = tokio::time::timeout(
                    timeout,
                    client.lock(key.as_str(), Some(LockOptions::new().with_lease(lease_id))),
                )
                .await;
                let response = match locked {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => {
                        return Err(KvError::LockCreate { reason: err.to_string() });
                    }
                    Err(_) => {
                        drop(client.lease_revoke(lease_id).await);
                        return Err(KvError::LockAlreadyOccupied { key: key.clone() });
                    }
                };
                let lock_key = String::from_utf8_lossy(response.key()).into_owned();

                // Record the holder label under the same lease.
                let put = client
                    .put(
                        format!("{key}/holder"),
                        label,
                        Some(PutOptions::new().with_lease(lease_id)),
                    )
                    .await;
                if let Err(err) = put {
                    tracing::warn!(key = %key, error = %err, "failed to record lock holder");
                }

                Ok(LockHandle { id: lease_id, key: lock_key })
            })
        })
    }

    fn refresh(&self, lock: &LockHandle) -> Result<(), KvError> {
        let lease_id = lock.id;
        self.with_client(|runtime, client| {
            runtime.block_on(async {
                let (mut keeper, mut stream) =
                    client.lease_keep_alive(lease_id).await.map_err(transport)?;
                keeper.keep_alive().await.map_err(transport)?;
                match stream.message().await.map_err(transport)? {
                    Some(response) if response.ttl() > 0 => Ok(()),
                    _ => Err(KvError::LockExpired),
                }
            })
        })
    }

    fn release(&self, lock: &LockHandle) -> Result<(), KvError> {
        let key = lock.key.clone();
        let lease_id = lock.id;
        self.with_client(|runtime, client| {
            runtime.block_on(async {
                client.unlock(key.as_str()).await.map_err(transport)?;
                client.lease_revoke(lease_id).await.map_err(transport)?;
                Ok(())
            })
        })
    }

    fn lease(&self, lease_id: i64) -> Result<Lease, KvError> {
        self.with_client(|runtime, client| {
            runtime.block_on(async {
                let response = client
                    .lease_time_to_live(lease_id, Some(LeaseTimeToLiveOptions::new().with_keys()))
                    .await
                    .map_err(transport)?;
                if response.ttl() < 0 {
                    return Err(KvError::LeaseExpired { id: lease_id });
                }
                let keys = response
                    .keys()
                    .iter()
                    .map(|key| String::from_utf8_lossy(key).into_owned())
                    .collect();
                Ok(Lease { id: lease_id, keys })
            })
        })
    }

    fn lock_from_lease(&self, lease: &Lease) -> Result<LockHandle, KvError> {
        match lease.keys.first() {
            Some(key) => Ok(LockHandle { id: lease.id, key: key.clone() }),
            None => Err(KvError::LeaseExpired { id: lease.id }),
        }
    }

    fn timeout(&self) -> Duration {
        self.config.timeout()
    }
}
