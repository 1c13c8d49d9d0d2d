use std::time::{Duration, SystemTime, UNIX_EPOCH};

use config::RedisConfig;
use rate_limit::{CounterKey, InMemoryStorage, RateLimitStorage, RedisStorage, SlidingWindow, TokenBucket};

const START: Duration = Duration::from_secs(1_700_000_000);

#[derive(Clone, Copy)]
enum Step {
    Allow(&'static str, u32, u64, u64),
    Check(&'static str, u32, u64, u64),
    Record(&'static str, u32, u64, u64),
}

// (principal, limit, window seconds, milliseconds since start)
const SCRIPT: &[Step] = &[
    Step::Allow("a", 3, 60, 0),
    Step::Allow("a", 3, 60, 0),
    Step::Allow("a", 3, 60, 10),
    Step::Allow("a", 3, 60, 20),
    Step::Allow("b", 3, 60, 20),
    Step::Allow("a", 3, 60, 19_999),
    Step::Allow("a", 3, 60, 20_010),
    Step::Allow("a", 3, 60, 20_011),
    // Time going backwards neither refills nor breaks the bucket.
    Step::Allow("a", 3, 60, 5_000),
    Step::Allow("c", 5, 1, 0),
    Step::Allow("c", 5, 1, 0),
    Step::Allow("c", 5, 1, 0),
    Step::Allow("c", 5, 1, 0),
    Step::Allow("c", 5, 1, 0),
    Step::Allow("c", 5, 1, 0),
    Step::Allow("c", 5, 1, 199),
    Step::Allow("c", 5, 1, 200),
    Step::Allow("c", 5, 1, 5_000),
    Step::Check("s", 2, 60, 0),
    Step::Record("s", 2, 60, 0),
    Step::Check("s", 2, 60, 1_000),
    Step::Record("s", 2, 60, 1_000),
    Step::Check("s", 2, 60, 2_000),
    Step::Check("s", 2, 60, 59_999),
    Step::Check("s", 2, 60, 60_000),
    Step::Record("s", 2, 60, 60_000),
    Step::Check("s", 2, 60, 60_500),
    Step::Check("s", 2, 60, 61_000),
    Step::Check("t", 0, 60, 0),
    Step::Record("t", 0, 60, 0),
    Step::Check("t", 0, 60, 0),
];

async fn run(storage: &impl RateLimitStorage) -> Vec<Option<bool>> {
    let mut decisions = Vec::with_capacity(SCRIPT.len());

    for step in SCRIPT {
        let decision = match *step {
            Step::Allow(principal, max, window, at) => {
                let key = CounterKey::UserTotal {
                    principal: principal.to_string(),
                };

                let bucket = TokenBucket::for_limit(max, window);
                Some(storage.allow(&key, bucket, START + Duration::from_millis(at)).await.unwrap())
            }
            Step::Check(principal, max, window, at) => {
                let key = CounterKey::UserSuccess {
                    principal: principal.to_string(),
                };

                let window = SlidingWindow {
                    max_count: max,
                    window: Duration::from_secs(window),
                };

                Some(
                    storage
                        .check_window(&key, window, START + Duration::from_millis(at))
                        .await
                        .unwrap(),
                )
            }
            Step::Record(principal, max, window, at) => {
                let key = CounterKey::UserSuccess {
                    principal: principal.to_string(),
                };

                let window = SlidingWindow {
                    max_count: max,
                    window: Duration::from_secs(window),
                };

                storage
                    .record_entry(&key, window, START + Duration::from_millis(at))
                    .await
                    .unwrap();

                None
            }
        };

        decisions.push(decision);
    }

    decisions
}

fn render(decisions: &[Option<bool>]) -> String {
    decisions
        .iter()
        .map(|decision| match decision {
            Some(true) => 'A',
            Some(false) => 'D',
            None => 'r',
        })
        .collect()
}

async fn redis_storage() -> Option<RedisStorage> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();

    let config = RedisConfig {
        url,
        key_prefix: format!("gateway-test:{}:{nanos}:", std::process::id()),
        ..Default::default()
    };

    match RedisStorage::new(&config).await {
        Ok(storage) => Some(storage),
        Err(e) => {
            eprintln!("skipping Redis backend test, no server reachable: {e}");
            None
        }
    }
}

#[tokio::test]
async fn memory_backend_decisions() {
    let storage = InMemoryStorage::new();
    let decisions = run(&storage).await;

    insta::assert_snapshot!(render(&decisions), @"AAADADADDAAAAADDAAArArDDArDAArA");
}

#[tokio::test]
async fn redis_backend_matches_memory_backend() {
    let Some(redis) = redis_storage().await else {
        return;
    };

    let memory = InMemoryStorage::new();

    assert_eq!(render(&run(&redis).await), render(&run(&memory).await));
}
