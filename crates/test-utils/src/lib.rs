pub mod builders;
pub mod fake_process;
pub mod fakes;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use nodeward::logging::{filter_directives, LOG_ENV};
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Upper bound for any single awaited step in the integration tests.
pub const TEST_DEADLINE: Duration = Duration::from_secs(10);

/// Route agent logs into the per-test capture buffer.
///
/// Honours `NODEWARD_LOG` exactly like the daemon does, so
/// `NODEWARD_LOG=nodeward::exec=trace cargo test -- --nocapture`
/// shows the supervise loop of a failing test.
pub fn init_tracing() {
    INIT.call_once(|| {
        let env = std::env::var(LOG_ENV).ok();
        let filter = EnvFilter::try_new(filter_directives(None, env.as_deref(), None))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, failing the test if it takes longer than [`TEST_DEADLINE`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(TEST_DEADLINE, f)
        .await
        .unwrap_or_else(|_| panic!("test step did not finish within {TEST_DEADLINE:?}"))
}

/// Poll `condition` every `every` until it holds, bounded by [`TEST_DEADLINE`].
///
/// For state the daemons change in the background (a task becoming
/// supervised, a metadata file being consumed).
pub async fn wait_until<C>(every: Duration, mut condition: C)
where
    C: FnMut() -> bool,
{
    with_timeout(async {
        while !condition() {
            tokio::time::sleep(every).await;
        }
    })
    .await;
}
