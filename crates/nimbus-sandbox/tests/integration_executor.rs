//! Integration tests for the WebAssembly executor.
//!
//! Entry scripts are WAT fixtures under `tests/fixtures/`; wasmtime compiles
//! the text format directly, so no guest toolchain is needed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use nimbus_core::SiteId;
use nimbus_sandbox::{
    ExecutionOutcome, Executor, ExecutorConfig, LeasePool, PoolConfig, Reaper, RequestSnapshot,
    ResourceCeilings, SandboxEngine, ScriptTarget, WasmExecutor,
};
use nimbus_state::{KvStore, StateStore};

const COUNTER: &str = include_str!("fixtures/counter.wat");
const GET_SET_COUNTER: &str = include_str!("fixtures/get_set_counter.wat");
const SPIN: &str = include_str!("fixtures/spin.wat");
const SEAL: &str = include_str!("fixtures/seal.wat");
const ECHO: &str = include_str!("fixtures/echo.wat");
const ENV: &str = include_str!("fixtures/env.wat");
const FRESH: &str = include_str!("fixtures/fresh.wat");
const OUT_OF_BOUNDS: &str = include_str!("fixtures/out_of_bounds.wat");
const TRAP: &str = include_str!("fixtures/trap.wat");
const NO_HANDLE: &str = include_str!("fixtures/no_handle.wat");
const BIG_MEMORY: &str = include_str!("fixtures/big_memory.wat");

// ── Harness ───────────────────────────────────────────────────────

struct Harness {
    executor: Arc<WasmExecutor>,
    store: Arc<StateStore>,
    dir: TempDir,
    _reaper: Reaper,
}

impl Harness {
    fn new() -> Self {
        let config = ExecutorConfig {
            timeout: Duration::from_secs(5),
            ..ExecutorConfig::default()
        };
        Self::with_config(config, PoolConfig::default())
    }

    fn with_config(config: ExecutorConfig, pool: PoolConfig) -> Self {
        let engine = SandboxEngine::new().unwrap();
        let pool = LeasePool::new(pool);
        let reaper = Reaper::spawn(engine.clone(), pool.clone(), config.epoch_tick).unwrap();
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let executor = WasmExecutor::new(engine, pool, store.clone(), store.clone(), config);
        Self {
            executor: Arc::new(executor),
            store,
            dir: tempfile::tempdir().unwrap(),
            _reaper: reaper,
        }
    }

    /// Write `source` as the entry script of `site` and return the target.
    fn target(&self, site: &str, source: &str) -> ScriptTarget {
        let root = self.dir.path().join(site);
        std::fs::create_dir_all(&root).unwrap();
        let entry_script = root.join("_worker.wat");
        std::fs::write(&entry_script, source).unwrap();
        ScriptTarget {
            site: SiteId::parse(site).unwrap(),
            entry_script,
        }
    }

    async fn run(&self, target: &ScriptTarget) -> ExecutionOutcome {
        self.executor
            .execute(target, RequestSnapshot::new("GET", "/"))
            .await
    }
}

fn completed(outcome: ExecutionOutcome) -> (u16, String) {
    match outcome {
        ExecutionOutcome::Completed(response) => {
            (response.status, String::from_utf8(response.body).unwrap())
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

fn fast_timeout() -> ExecutorConfig {
    ExecutorConfig {
        timeout: Duration::from_millis(100),
        epoch_tick: Duration::from_millis(10),
        ..ExecutorConfig::default()
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[tokio::test]
async fn counter_persists_across_executions() {
    let h = Harness::new();
    let target = h.target("blog", COUNTER);

    for expected in 1..=3 {
        let outcome = h.run(&target).await;
        let ExecutionOutcome::Completed(response) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(response.status, 200);
        assert!(
            response
                .headers
                .iter()
                .any(|(k, v)| k == "content-type" && v == "application/json")
        );
        assert_eq!(
            String::from_utf8(response.body).unwrap(),
            format!("{{\"visits\":{expected}}}")
        );
    }
}

#[tokio::test]
async fn counter_is_isolated_per_site() {
    let h = Harness::new();
    let a = h.target("alpha", COUNTER);
    let b = h.target("beta", COUNTER);

    for _ in 0..3 {
        completed(h.run(&a).await);
    }
    assert_eq!(completed(h.run(&b).await).1, r#"{"visits":1}"#);

    let alpha = SiteId::parse("alpha").unwrap();
    let beta = SiteId::parse("beta").unwrap();
    assert_eq!(h.store.get(&alpha, b"visits").unwrap(), Some(b"3".to_vec()));
    assert_eq!(h.store.get(&beta, b"visits").unwrap(), Some(b"1".to_vec()));
}

#[tokio::test]
async fn get_set_counter_treats_absent_as_zero() {
    let h = Harness::new();
    let target = h.target("tally", GET_SET_COUNTER);

    for expected in 1..=3 {
        assert_eq!(completed(h.run(&target).await), (200, expected.to_string()));
    }
    let tally = SiteId::parse("tally").unwrap();
    assert_eq!(h.store.get(&tally, b"visits").unwrap(), Some(b"3".to_vec()));
}

#[tokio::test]
async fn kv_get_returns_full_length_when_buffer_is_short() {
    let h = Harness::new();
    let site = SiteId::parse("tally").unwrap();
    // Two bytes do not fit the script's one-byte first read.
    h.store.set(&site, b"visits", b"99").unwrap();
    let target = h.target("tally", GET_SET_COUNTER);

    assert_eq!(completed(h.run(&target).await).1, "100");
    assert_eq!(completed(h.run(&target).await).1, "101");
    assert_eq!(h.store.get(&site, b"visits").unwrap(), Some(b"101".to_vec()));

    // Another site starts from nothing.
    let other = h.target("other", GET_SET_COUNTER);
    assert_eq!(completed(h.run(&other).await).1, "1");
}

#[tokio::test]
async fn request_view_and_response_builder() {
    let h = Harness::new();
    let target = h.target("echo", ECHO);
    let request = RequestSnapshot::new("POST", "/hello")
        .with_header("X-Trace", "yes")
        .with_body(b"payload".to_vec());

    let (status, body) = completed(h.executor.execute(&target, request).await);
    assert_eq!(status, 201);
    assert_eq!(body, "POST /hello yes payload");
}

#[tokio::test]
async fn send_seals_the_response() {
    let h = Harness::new();
    let target = h.target("sealed", SEAL);

    let ExecutionOutcome::Completed(response) = h.run(&target).await else {
        panic!("expected completion");
    };
    assert_eq!(response.status, 202);
    assert_eq!(response.body, b"first");
    assert!(response.headers.iter().all(|(k, _)| k != "x-late"));
}

#[tokio::test]
async fn every_execution_gets_a_fresh_instance() {
    let h = Harness::new();
    let target = h.target("fresh", FRESH);
    for _ in 0..3 {
        assert_eq!(completed(h.run(&target).await).1, "1");
    }
}

#[tokio::test]
async fn secrets_are_scoped_to_the_site() {
    let h = Harness::new();
    let owner = SiteId::parse("owner").unwrap();
    h.store.put_secret(&owner, "API_TOKEN", "s3cret").unwrap();

    let with_secret = h.target("owner", ENV);
    let without = h.target("other", ENV);

    assert_eq!(completed(h.run(&with_secret).await).1, "s3cret");
    assert_eq!(completed(h.run(&without).await).1, "missing");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runaway_script_times_out_within_window() {
    let h = Harness::with_config(fast_timeout(), PoolConfig::default());
    let target = h.target("spin", SPIN);
    // The first run also pays for compilation.
    assert_eq!(h.run(&target).await, ExecutionOutcome::TimedOut);

    let started = Instant::now();
    let outcome = h.run(&target).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome, ExecutionOutcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(100), "trapped early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(400), "trapped late: {elapsed:?}");

    let response = outcome.into_response();
    assert_eq!(response.status, 500);
    assert_eq!(response.body, b"execution timeout");

    // The slot is back in the pool.
    assert_eq!(h.executor.pool().active(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spinning_scripts_do_not_stall_other_sites() {
    let config = ExecutorConfig {
        timeout: Duration::from_secs(1),
        epoch_tick: Duration::from_millis(10),
        ..ExecutorConfig::default()
    };
    let h = Harness::with_config(config, PoolConfig::default());
    let spin = h.target("spin", SPIN);
    let counter = h.target("quick", COUNTER);
    // Warm the compile cache for both scripts.
    assert!(matches!(h.run(&counter).await, ExecutionOutcome::Completed(_)));
    assert_eq!(h.run(&spin).await, ExecutionOutcome::TimedOut);

    // Three times as many runaway scripts as runtime workers.
    let spinners: Vec<_> = (0..6)
        .map(|_| {
            let executor = h.executor.clone();
            let spin = spin.clone();
            tokio::spawn(async move {
                executor
                    .execute(&spin, RequestSnapshot::new("GET", "/"))
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let executor = h.executor.clone();
    let quick = tokio::spawn(async move {
        let started = Instant::now();
        let outcome = executor
            .execute(&counter, RequestSnapshot::new("GET", "/"))
            .await;
        (outcome, started.elapsed())
    });
    let (outcome, elapsed) = quick.await.unwrap();
    assert_eq!(completed(outcome).1, r#"{"visits":2}"#);
    assert!(
        elapsed < Duration::from_millis(500),
        "unrelated site stalled for {elapsed:?}"
    );

    for spinner in spinners {
        assert_eq!(spinner.await.unwrap(), ExecutionOutcome::TimedOut);
    }
    assert_eq!(h.executor.pool().active(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn saturated_pool_reports_busy() {
    let pool = PoolConfig {
        capacity: 1,
        wait: Duration::from_millis(20),
        grace: Duration::from_millis(250),
    };
    let h = Harness::with_config(fast_timeout(), pool);
    let spin = h.target("spin", SPIN);
    let echo = h.target("echo", ECHO);

    // Warm the compile cache so only execution holds the slot.
    assert!(matches!(h.run(&echo).await, ExecutionOutcome::Completed(_)));
    assert_eq!(h.run(&spin).await, ExecutionOutcome::TimedOut);

    let executor = h.executor.clone();
    let running = tokio::spawn(async move {
        executor
            .execute(&spin, RequestSnapshot::new("GET", "/"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = h.run(&echo).await;
    assert_eq!(outcome, ExecutionOutcome::Busy);
    assert_eq!(outcome.into_response().status, 503);

    assert_eq!(running.await.unwrap(), ExecutionOutcome::TimedOut);
    // Once the runaway script is gone the pool serves again.
    assert!(matches!(h.run(&echo).await, ExecutionOutcome::Completed(_)));
}

#[tokio::test]
async fn guest_faults_are_errors() {
    let h = Harness::new();
    for (site, source) in [
        ("trap", TRAP),
        ("oob", OUT_OF_BOUNDS),
        ("nohandle", NO_HANDLE),
    ] {
        let outcome = h.run(&h.target(site, source)).await;
        assert_eq!(outcome, ExecutionOutcome::Errored, "fixture {site}");
        let response = outcome.into_response();
        assert_eq!(response.body, b"internal error");
    }
}

#[tokio::test]
async fn unparseable_script_is_an_error() {
    let h = Harness::new();
    let outcome = h.run(&h.target("broken", "(module (func")).await;
    assert_eq!(outcome, ExecutionOutcome::Errored);
}

#[tokio::test]
async fn memory_ceiling_is_enforced() {
    let config = ExecutorConfig {
        ceilings: ResourceCeilings {
            memory_bytes: 1024 * 1024,
            table_elements: 16,
        },
        ..ExecutorConfig::default()
    };
    let h = Harness::with_config(config, PoolConfig::default());
    let outcome = h.run(&h.target("hungry", BIG_MEMORY)).await;
    assert_eq!(outcome, ExecutionOutcome::Errored);
}
