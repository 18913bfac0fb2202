use std::sync::Arc;
use std::time::Duration;

use ipcroute_channel::{ChannelConfig, Connector, DuplexChannel, HandshakeConfig, SharedChannel};
use ipcroute_service::ServiceInterface;
use ipcroute_wire::Message;
use tracing::debug;

use crate::cmd::{parse_duration, parse_params, CallArgs, Context};
use crate::exit::{channel_error, response_code, service_error, CliResult};
use crate::output::print_message;

pub fn run(args: CallArgs, context: &Context) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let params = parse_params(args.params.as_deref())?;

    let channel = connect(context, &args.service, timeout)?;
    let service = ServiceInterface::new(Arc::clone(&channel) as SharedChannel, &args.service);

    let mut request = Message::request(&args.method);
    if let Some(params) = params {
        request = request.with_params(params);
    }
    debug!(service = %args.service, method = %args.method, id = request.id, "calling");
    let result = service.call(request, timeout);
    channel.dispose();

    let response = result.map_err(|err| service_error("call failed", err))?;
    print_message(&response, &args.service, context.format);
    Ok(response_code(&response))
}

/// Open a channel to `service`, waiting at most `timeout` for its listener.
pub(crate) fn connect(
    context: &Context,
    service: &str,
    timeout: Duration,
) -> CliResult<Arc<DuplexChannel>> {
    let config = ChannelConfig::default().with_handshake(
        HandshakeConfig::default()
            .with_connect_timeout(timeout)
            .with_rendezvous_timeout(timeout),
    );
    Connector::new(context.transport()?)
        .with_config(config)
        .connect(service)
        .map_err(|err| channel_error("connect failed", err))
}
