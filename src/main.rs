use anyhow::Result;
use clap::Parser;
use rsip::{Request, Response};
use sipbroker::{
    config::{Cli, Config},
    error::TransportError,
    sip::{CorrelationToken, DialogId, Interface, OutgoingDialog, SignalingTransport, TransactionId},
    BrokerBuilder,
};
use std::{fs::File, sync::Arc, time::Duration};
use tokio::select;
use tracing::{info, level_filters::LevelFilter, warn};

/// Stand-in used when no signaling stack is linked in: every send is refused,
/// so sessions fail fast instead of waiting on a network that is not there.
struct UnboundTransport;

impl UnboundTransport {
    fn refuse<T>(&self, what: &str) -> Result<T, TransportError> {
        Err(TransportError::send(what, "no signaling stack attached"))
    }
}

impl SignalingTransport for UnboundTransport {
    fn new_call_id(&self) -> String {
        sipbroker::sip::message::random_tag()
    }

    fn send_dialog_request(
        &self,
        _interface: Interface,
        request: Request,
        _token: CorrelationToken,
    ) -> Result<OutgoingDialog, TransportError> {
        self.refuse(&request.method.to_string())
    }

    fn send_request(
        &self,
        _interface: Interface,
        request: Request,
        _token: CorrelationToken,
    ) -> Result<TransactionId, TransportError> {
        self.refuse(&request.method.to_string())
    }

    fn send_in_dialog(
        &self,
        _dialog: &DialogId,
        request: Request,
        _token: CorrelationToken,
    ) -> Result<TransactionId, TransportError> {
        self.refuse(&request.method.to_string())
    }

    fn send_prack(
        &self,
        _dialog: &DialogId,
        _reliable: &Response,
        _token: CorrelationToken,
    ) -> Result<TransactionId, TransportError> {
        self.refuse("PRACK")
    }

    fn send_ack(&self, _dialog: &DialogId, _cseq: u32, _ack: Request) -> Result<(), TransportError> {
        self.refuse("ACK")
    }

    fn send_cancel(
        &self,
        _invite: &TransactionId,
        _token: CorrelationToken,
    ) -> Result<TransactionId, TransportError> {
        self.refuse("CANCEL")
    }

    fn send_response(&self, _server_tx: &TransactionId, response: Response) -> Result<(), TransportError> {
        self.refuse(&format!("{} response", response.status_code.code()))
    }

    fn send_reliable_provisional(
        &self,
        _dialog: &DialogId,
        _server_tx: &TransactionId,
        response: Response,
    ) -> Result<(), TransportError> {
        self.refuse(&format!("{} response", response.status_code.code()))
    }

    fn send_stateless_response(
        &self,
        _interface: Interface,
        response: Response,
    ) -> Result<(), TransportError> {
        self.refuse(&format!("{} response", response.status_code.code()))
    }

    fn bind_dialog(&self, _dialog: &DialogId, _token: CorrelationToken) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.conf {
        Some(ref conf) if std::path::Path::new(conf).exists() || cli.check => Config::load(conf)?,
        _ => Config::default(),
    };

    if cli.check {
        println!("{}", config.summary());
        return Ok(());
    }

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.broker.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard = if let Some(ref log_file) = config.broker.log_file {
        let file = File::create(log_file)
            .map_err(|e| anyhow::anyhow!("failed to create log file {}: {}", log_file, e))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Some(guard)
    } else {
        log_fmt.try_init().ok();
        None
    };

    let broker = BrokerBuilder::new()
        .config(config)
        .transport(Arc::new(UnboundTransport))
        .build()?;

    info!("starting {}", sipbroker::version::VERSION);
    warn!("no signaling stack attached, outgoing messages will be refused");
    select! {
        r = broker.serve(Duration::from_secs(60)) => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received CTRL+C, shutting down");
            broker.stop();
        }
    }
    Ok(())
}
