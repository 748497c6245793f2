//! corun demos - the coroutine walkthrough on the wall clock
//!
//! Usage: demos [name...]
//!
//! Without arguments every demo runs in order. Set RUST_LOG=debug to watch
//! the scheduler.

use corun::{
    Config, Flow, RuntimeResult, coroutine_scope, delay, flow, measure_time, run_blocking_with,
    with_timeout_or_null,
};
use std::io::Write;
use std::time::Duration;

type Demo = fn() -> RuntimeResult<()>;

const DEMOS: &[(&str, Demo)] = &[
    ("simple", simple_async),
    ("scopes", multiple_suspending_functions),
    ("lightweight", lightweight_coroutines),
    ("flows", flows),
    ("timeout", flows_with_timeout),
    ("compose", sequential_and_async),
];

fn config(name: &str) -> Config {
    Config::wall().name(name)
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Launch a child and keep going while it sleeps
fn simple_async() -> RuntimeResult<()> {
    run_blocking_with(config("simple"), |scope| async move {
        scope.launch(async {
            delay(ms(1000)).await;
            println!("World!");
        });
        println!("Hello,");
    })
}

/// A nested scope waits for both of its children
fn multiple_suspending_functions() -> RuntimeResult<()> {
    run_blocking_with(config("scopes"), |_| async {
        coroutine_scope(|scope| async move {
            scope.launch(async {
                delay(ms(2000)).await;
                println!("World 2");
            });
            scope.launch(async {
                delay(ms(1000)).await;
                println!("World 1");
            });
            println!("Hello");
        })
        .await;
        println!("Done");
    })
}

/// 100 000 tasks sleeping at once
fn lightweight_coroutines() -> RuntimeResult<()> {
    run_blocking_with(config("lightweight"), |scope| async move {
        for _ in 0..100_000 {
            scope.launch(async {
                delay(ms(1000)).await;
                print!(".");
            });
        }
    })?;
    println!();
    std::io::stdout().flush().ok();
    Ok(())
}

fn simple() -> Flow<i32> {
    flow(|emitter| async move {
        for i in 1..=3 {
            delay(ms(100)).await;
            emitter.emit(i).await;
        }
    })
}

/// Collect a flow while a sibling keeps printing
fn flows() -> RuntimeResult<()> {
    run_blocking_with(config("flows"), |scope| async move {
        scope.launch(async {
            for k in 1..=3 {
                println!("I'm not blocked {k}");
                delay(ms(100)).await;
            }
        });

        let (_, elapsed) = measure_time(simple().collect(|value| println!("{value}"))).await;
        println!("Collected in {} ms", elapsed.as_millis());
    })
}

/// Like `simple`, but says when it is about to emit
fn announced() -> Flow<i32> {
    flow(|emitter| async move {
        for i in 1..=3 {
            delay(ms(100)).await;
            println!("Emitting {i}");
            emitter.emit(i).await;
        }
    })
}

/// Stop collecting after 250ms; the third value is never produced
fn flows_with_timeout() -> RuntimeResult<()> {
    run_blocking_with(config("timeout"), |_| async {
        let finished = with_timeout_or_null(ms(250), |_| async {
            announced().collect(|value| println!("{value}")).await;
        })
        .await;
        if finished.is_none() {
            println!("Timed out");
        }
        println!("Done");
    })
}

async fn do_something_useful_one() -> i32 {
    delay(ms(1000)).await;
    13
}

async fn do_something_useful_two() -> i32 {
    delay(ms(1000)).await;
    29
}

/// The same two calls, one after the other and then concurrently
fn sequential_and_async() -> RuntimeResult<()> {
    run_blocking_with(config("compose"), |scope| async move {
        let (sum, elapsed) = measure_time(async {
            do_something_useful_one().await + do_something_useful_two().await
        })
        .await;
        println!("The answer is {sum}");
        println!("Completed in {} ms", elapsed.as_millis());

        let (sum, elapsed) = measure_time(async {
            let one = scope.spawn_async(do_something_useful_one());
            let two = scope.spawn_async(do_something_useful_two());
            match (one.await, two.await) {
                (Ok(one), Ok(two)) => Some(one + two),
                _ => None,
            }
        })
        .await;
        match sum {
            Some(sum) => println!("The answer is {sum}"),
            None => println!("A computation was cancelled"),
        }
        println!("Completed in {} ms", elapsed.as_millis());
    })
}

fn main() -> RuntimeResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default())
        .format_timestamp(None)
        .try_init()
        .ok();

    let wanted: Vec<String> = std::env::args().skip(1).collect();
    for (name, demo) in DEMOS {
        if !wanted.is_empty() && !wanted.iter().any(|w| w.as_str() == *name) {
            continue;
        }
        println!("== {name} ==");
        demo()?;
        println!();
    }

    for name in &wanted {
        if !DEMOS.iter().any(|(known, _)| *known == name.as_str()) {
            log::warn!("unknown demo: {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corun::run_blocking;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_announced_stops_at_timeout() {
        let outcome = run_blocking(|_| async {
            let seen = Rc::new(RefCell::new(Vec::new()));
            let sink = seen.clone();
            let finished = with_timeout_or_null(ms(250), |_| async move {
                announced().collect(|value| sink.borrow_mut().push(value)).await;
            })
            .await;
            (finished, seen.take())
        })
        .unwrap();

        assert_eq!(outcome, (None, vec![1, 2]));
    }
}
