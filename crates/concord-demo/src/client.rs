//! One demo client: a session, a mutex, and a loop of fenced writes

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use concord_concurrency::{
    CancelSignal, GuardedError, LockError, Mutex, Session, SessionConfig, with_lock,
};
use concord_store::KvStore;

use crate::shutdown::ShutdownSignal;

/// Per-client settings derived from the demo config
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub id: String,
    pub lock_name: String,
    pub key: String,
    pub iterations: u64,
    pub min_pause: Duration,
    pub max_pause: Duration,
    pub session: SessionConfig,
}

impl ClientSettings {
    fn pause(&self) -> Duration {
        if self.min_pause >= self.max_pause {
            return self.min_pause;
        }
        rand::rng().random_range(self.min_pause..=self.max_pause)
    }
}

/// Run the lock loop until `iterations` cycles complete or shutdown.
///
/// Returns the number of completed cycles.
pub async fn run(
    store: Arc<dyn KvStore>,
    settings: ClientSettings,
    shutdown: &ShutdownSignal,
) -> anyhow::Result<u64> {
    let session = Session::open_with_config(store, settings.session.clone()).await?;
    let mut mutex = Mutex::with_holder(&session, settings.lock_name.clone(), settings.id.clone());

    let ctx = CancelSignal::new();
    let mut shutdown_rx = shutdown.subscribe();
    let on_shutdown = ctx.clone();
    let bridge = tokio::spawn(async move {
        let _ = shutdown_rx.recv().await;
        on_shutdown.cancel();
    });

    let outcome = lock_loop(&mut mutex, &ctx, &settings).await;
    bridge.abort();

    session.close().await?;
    let completed = outcome?;
    info!("Client {} finished after {} cycles", settings.id, completed);
    Ok(completed)
}

async fn lock_loop(
    mutex: &mut Mutex,
    ctx: &CancelSignal,
    settings: &ClientSettings,
) -> anyhow::Result<u64> {
    let mut completed = 0u64;

    while settings.iterations == 0 || completed < settings.iterations {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = tokio::time::sleep(settings.pause()) => {}
        }

        let key = settings.key.clone();
        let value = format!("{}-value-{}", settings.id, completed);
        let hold = settings.pause();
        let id = settings.id.as_str();
        let result = with_lock(mutex, ctx, |fence| async move {
            fence.put(&key, value.clone()).await?;
            info!("{} wrote {}={} (fence revision {})", id, key, value, fence.revision());
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = tokio::time::sleep(hold) => {}
            }
            Ok::<_, LockError>(())
        })
        .await;

        match result {
            Ok(()) => completed += 1,
            Err(GuardedError::Lock(LockError::Cancelled)) => break,
            Err(GuardedError::Lock(e)) if e.is_retryable() => {
                warn!("{} lock attempt failed, retrying: {}", settings.id, e);
            }
            Err(GuardedError::Operation(e)) => {
                warn!("{} write rejected: {}", settings.id, e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(completed)
}
