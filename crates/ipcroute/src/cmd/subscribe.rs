use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use ipcroute_channel::{Channel, ChannelEvent, SharedChannel};
use ipcroute_service::{Handler, Service, ServiceInterface};
use ipcroute_wire::Message;
use tracing::{info, warn};

use crate::cmd::call::connect;
use crate::cmd::{install_ctrlc_handler, parse_duration, Context, SubscribeArgs};
use crate::exit::{service_error, CliResult, SUCCESS, TRANSPORT_ERROR};
use crate::output::print_message;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

enum Update {
    Notification(Message),
    Lost,
}

pub fn run(args: SubscribeArgs, context: &Context) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let running = install_ctrlc_handler()?;

    let channel = connect(context, &args.service, timeout)?;
    let (tx, rx) = mpsc::channel();

    let lost = tx.clone();
    let watch = channel.events().add(move |event| {
        if let ChannelEvent::Disconnected { .. } = event {
            let _ = lost.send(Update::Lost);
        }
    });

    let service = ServiceInterface::new(Arc::clone(&channel) as SharedChannel, &args.service);
    let handler = Handler::new(move |message| {
        let _ = tx.send(Update::Notification(message));
    });
    service
        .subscribe(&args.command, &handler)
        .map_err(|err| service_error("subscribe failed", err))?;
    info!(service = %args.service, command = %args.command, "subscribed");

    let mut received = 0usize;
    let mut code = SUCCESS;
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Update::Notification(message)) => {
                print_message(&message, &args.service, context.format);
                received += 1;
                if args.count.is_some_and(|count| received >= count) {
                    break;
                }
            }
            Ok(Update::Lost) => {
                warn!(service = %args.service, "connection lost");
                code = TRANSPORT_ERROR;
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if code == SUCCESS {
        if let Err(err) = service.unsubscribe(&args.command, &handler) {
            warn!(error = %err, "unsubscribe failed");
        }
    }
    channel.events().remove(watch);
    channel.dispose();
    Ok(code)
}
