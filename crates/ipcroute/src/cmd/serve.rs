use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipcroute_channel::{Listener, Multiplexer, SameUserCheck, SharedChannel};
use ipcroute_service::{EventSource, RouteTable, Router};
use serde_json::{json, Value};
use tracing::info;

use crate::cmd::{install_ctrlc_handler, parse_duration, Context, ServeArgs};
use crate::exit::{channel_error, CliResult, SUCCESS};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn run(args: ServeArgs, context: &Context) -> CliResult<i32> {
    let tick_interval = parse_duration(&args.tick_interval)?;
    let running = install_ctrlc_handler()?;

    let mut listener = Listener::bind(context.transport()?, &args.name)
        .map_err(|err| channel_error("bind failed", err))?;
    if args.same_user {
        listener = listener.with_authorization(SameUserCheck);
    }
    let listener = Arc::new(listener);
    let incoming: SharedChannel = Multiplexer::new(&*listener);

    let ticks = EventSource::new();
    let table = demo_table(&args.name, &ticks, Arc::clone(&running));
    let router = Router::new();
    router.add_service(&table);
    router.attach(&incoming);

    listener
        .start()
        .map_err(|err| channel_error("listen failed", err))?;
    info!(service = %args.name, routes = ?router.routes(), "serving");

    let mut count = 0u64;
    let mut next_tick = Instant::now() + tick_interval;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(POLL_INTERVAL);
        if Instant::now() >= next_tick {
            count += 1;
            ticks.publish(json!(count));
            next_tick += tick_interval;
        }
    }

    info!(service = %args.name, "shutting down");
    listener.dispose();
    router.dispose();
    Ok(SUCCESS)
}

/// Routes of the demo service hosted under `name`.
fn demo_table(name: &str, ticks: &EventSource, running: Arc<AtomicBool>) -> Arc<RouteTable> {
    let started = Instant::now();
    let calls = Arc::new(AtomicU64::new(0));
    let echo_calls = Arc::clone(&calls);

    RouteTable::builder()
        .method(format!("{name}/echo"), move |message| {
            echo_calls.fetch_add(1, Ordering::Relaxed);
            Ok(message.params.clone().unwrap_or(Value::Null))
        })
        .action(format!("{name}/exit"), move |_| {
            running.store(false, Ordering::SeqCst);
            Ok(())
        })
        .read_only(format!("{name}/uptime"), move || {
            json!(started.elapsed().as_secs())
        })
        .read_only(format!("{name}/calls"), move || {
            json!(calls.load(Ordering::Relaxed))
        })
        .event(format!("{name}/tick"), ticks)
        .build()
}
