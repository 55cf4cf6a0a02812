use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bacstack::address::Address;
use bacstack::apdu::codes::{ConfirmedServiceChoice, MaxApduLength, RejectReason, Segmentation, UnconfirmedServiceChoice};
use bacstack::config::TransportConfig;
use bacstack::error::ServiceFailure;
use bacstack::ip_network::{UdpNetwork, DEFAULT_PORT};
use bacstack::service::{ConfirmedService, RawService, RequestContext, Service, ServiceFactory, UnconfirmedService};
use bacstack::transport::Transport;
use bytes::{Bytes, BytesMut};
use clap::Parser;
use clap_derive::Parser;
use tracing::{info, Level};

/// Runs a BACnet/IP node that answers ConfirmedPrivateTransfer requests by echoing their
///  payload, and optionally sends one itself.
#[derive(Parser)]
struct Args {
    #[clap(default_value_t = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT))]
    local_address: SocketAddrV4,

    #[clap(long, default_value_t = Ipv4Addr::BROADCAST)]
    broadcast: Ipv4Addr,

    /// send a ConfirmedPrivateTransfer request to this peer and print the outcome
    #[clap(long)]
    peer: Option<SocketAddrV4>,

    /// size of the request's payload, big payloads are segmented
    #[clap(long, default_value_t = 100)]
    payload_len: usize,

    #[clap(long, default_value_t = 5)]
    segment_window: u8,

    /// broadcast a Who-Is on startup
    #[clap(long, default_value_t = false)]
    who_is: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct Echo {
    payload: Bytes,
}

impl Service for Echo {
    fn choice_id(&self) -> u8 {
        ConfirmedServiceChoice::ConfirmedPrivateTransfer.into()
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.payload);
    }
}

impl ConfirmedService for Echo {
    fn handle(&self, ctx: &RequestContext) -> Result<Option<Bytes>, ServiceFailure> {
        info!("echoing {} bytes to {:?}", self.payload.len(), ctx.source);
        Ok(Some(self.payload.clone()))
    }
}

struct Announcement {
    service_choice: u8,
}

impl Service for Announcement {
    fn choice_id(&self) -> u8 {
        self.service_choice
    }

    fn serialize(&self, _buf: &mut BytesMut) {}
}

impl UnconfirmedService for Announcement {
    fn handle(&self, ctx: &RequestContext) -> anyhow::Result<()> {
        info!("{:?} from {:?}", UnconfirmedServiceChoice::from(self.service_choice), ctx.source);
        Ok(())
    }
}

struct EchoServices;

impl ServiceFactory for EchoServices {
    fn supports_confirmed(&self, service_choice: u8) -> bool {
        ConfirmedServiceChoice::from(service_choice) == ConfirmedServiceChoice::ConfirmedPrivateTransfer
    }

    fn parse_confirmed(&self, service_choice: u8, payload: &[u8]) -> Result<Box<dyn ConfirmedService>, ServiceFailure> {
        if !self.supports_confirmed(service_choice) {
            return Err(ServiceFailure::Reject(RejectReason::UnrecognizedService));
        }
        Ok(Box::new(Echo {
            payload: Bytes::copy_from_slice(payload),
        }))
    }

    fn parse_unconfirmed(&self, service_choice: u8, _payload: &[u8]) -> anyhow::Result<Box<dyn UnconfirmedService>> {
        Ok(Box::new(Announcement { service_choice }))
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = TransportConfig {
        segment_window: args.segment_window,
        ..TransportConfig::default()
    };

    let network = Arc::new(UdpNetwork::bind(args.local_address, args.broadcast).await?);
    let transport = Transport::new(config, network.clone(), Arc::new(EchoServices))?;

    let incoming = Arc::new(transport.incoming_sender());
    let recv_network = network.clone();
    tokio::spawn(async move { recv_network.recv_loop(incoming).await });

    if args.who_is {
        transport.broadcast_unconfirmed(&RawService::new(UnconfirmedServiceChoice::WhoIs, &[])).await;
    }

    if let Some(peer) = args.peer {
        let payload = (0..args.payload_len)
            .map(|i| i as u8)
            .collect::<Vec<_>>();
        let future = transport.send_confirmed(
            Address::from(peer),
            None,
            MaxApduLength::Up1476,
            Segmentation::Both,
            &RawService::new(ConfirmedServiceChoice::ConfirmedPrivateTransfer, &payload),
        ).await;

        let response = future.get(Some(Duration::from_secs(60))).await
            .map_err(|e| anyhow!("request to {} failed: {}", peer, e))?;
        info!("response from {}: {:?}", peer, response);
        transport.shutdown().await;
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    transport.shutdown().await;
    Ok(())
}
