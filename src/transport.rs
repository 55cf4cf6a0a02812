//! The public face of the transport engine: a cheaply clonable [Transport] handle for
//!  application code, an [IncomingSender] for the network, and the dispatch loop connecting
//!  them to the [TransportCore].
//!
//! All protocol state lives in the dispatch loop's task. Handles talk to it through bounded
//!  queues, one for commands from the application and one for frames from the network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::{select, time};
use tracing::{debug, info, trace, warn};

use crate::address::Address;
use crate::apdu::codes::{MaxApduLength, Segmentation};
use crate::clock::{Clock, SystemClock};
use crate::config::TransportConfig;
use crate::error::ServiceError;
use crate::network::{FrameReceiver, IncomingFrame, Network};
use crate::service::{Service, ServiceFactory};
use crate::service_future::{service_future, ResponseSender, ServiceFuture};
use crate::snapshot::SnapshotCell;
use crate::transport_core::{CommunicationControl, OutgoingRequest, SharedCommunicationControl, TransportCore};
use crate::unacked::InFlightExchange;

enum Command {
    SendConfirmed(OutgoingRequest, ResponseSender),
    SendUnconfirmed {
        to: Address,
        broadcast: bool,
        service_choice: u8,
        payload: Bytes,
    },
    Shutdown,
}

/// Handle for sending requests through the transport engine. Clones share the same engine,
///  which keeps running until [Transport::shutdown] is called or all handles are dropped.
#[derive(Clone)]
pub struct Transport {
    commands: mpsc::Sender<Command>,
    incoming: mpsc::Sender<IncomingFrame>,
    network: Arc<dyn Network>,
    communication_control: Arc<SharedCommunicationControl>,
    in_flight: Arc<SnapshotCell<Vec<InFlightExchange>>>,
}

impl Transport {
    /// Starts the dispatch loop on the current tokio runtime
    pub fn new(config: TransportConfig, network: Arc<dyn Network>, services: Arc<dyn ServiceFactory>) -> anyhow::Result<Transport> {
        Self::with_clock(config, network, services, Arc::new(SystemClock))
    }

    pub fn with_clock(config: TransportConfig, network: Arc<dyn Network>, services: Arc<dyn ServiceFactory>, clock: Arc<dyn Clock>) -> anyhow::Result<Transport> {
        config.validate()?;
        let config = Arc::new(config);

        let (commands, command_receiver) = mpsc::channel(config.queue_capacity);
        let (incoming, incoming_receiver) = mpsc::channel(config.queue_capacity);
        let communication_control = Arc::new(SharedCommunicationControl::default());
        let in_flight = Arc::new(SnapshotCell::default());

        let core = TransportCore::new(
            config.clone(),
            network.clone(),
            services,
            clock,
            communication_control.clone(),
            in_flight.clone(),
        );
        tokio::spawn(dispatch_loop(core, command_receiver, incoming_receiver, config.idle_sleep));

        Ok(Transport {
            commands,
            incoming,
            network,
            communication_control,
            in_flight,
        })
    }

    /// The handle a network uses to pass received frames to this transport
    pub fn incoming_sender(&self) -> IncomingSender {
        IncomingSender {
            incoming: self.incoming.clone(),
        }
    }

    /// Sends a confirmed request. `max_apdu_length_accepted` and `segmentation_supported` are
    ///  the peer's capabilities, typically from its I-Am; they determine if and how the request
    ///  is segmented.
    pub async fn send_confirmed(
        &self,
        to: Address,
        link_service: Option<Address>,
        max_apdu_length_accepted: MaxApduLength,
        segmentation_supported: Segmentation,
        service: &dyn Service,
    ) -> ServiceFuture {
        if !self.communication_control.get().allows_confirmed_initiation() {
            debug!("communication is disabled - not sending request {} to {:?}", service.choice_id(), to);
            return ServiceFuture::resolved_with_error(ServiceError::CommunicationDisabled);
        }

        let request = OutgoingRequest {
            to,
            link_service,
            max_apdu_length_accepted,
            segmentation_supported,
            service_choice: service.choice_id(),
            payload: Self::serialize(service),
        };

        let (sender, future) = service_future();
        if self.commands.send(Command::SendConfirmed(request, sender)).await.is_err() {
            // the command is dropped with its ResponseSender, completing the future
            debug!("dispatch loop terminated - request was not sent");
        }
        future
    }

    /// Sends an unconfirmed request, or silently does nothing if communication control does not
    ///  allow it.
    pub async fn send_unconfirmed(&self, to: Address, service: &dyn Service) {
        self.do_send_unconfirmed(to, false, service).await
    }

    pub async fn broadcast_unconfirmed(&self, service: &dyn Service) {
        let to = self.network.local_broadcast_address();
        self.do_send_unconfirmed(to, true, service).await
    }

    async fn do_send_unconfirmed(&self, to: Address, broadcast: bool, service: &dyn Service) {
        let service_choice = service.choice_id();
        if !self.communication_control.get().allows_unconfirmed_initiation(service_choice) {
            debug!("communication is disabled - not sending unconfirmed request {} to {:?}", service_choice, to);
            return;
        }

        let command = Command::SendUnconfirmed {
            to,
            broadcast,
            service_choice,
            payload: Self::serialize(service),
        };
        if self.commands.send(command).await.is_err() {
            warn!("dispatch loop terminated - unconfirmed request {} was not sent", service_choice);
        }
    }

    fn serialize(service: &dyn Service) -> Bytes {
        let mut buf = BytesMut::new();
        service.serialize(&mut buf);
        buf.freeze()
    }

    pub fn communication_control(&self) -> CommunicationControl {
        self.communication_control.get()
    }

    pub fn set_communication_control(&self, value: CommunicationControl) {
        info!("communication control: {:?}", value);
        self.communication_control.set(value);
    }

    /// The exchanges in flight as of the dispatch loop's last iteration that changed them
    pub fn in_flight(&self) -> Arc<Vec<InFlightExchange>> {
        self.in_flight.get()
    }

    /// Stops the dispatch loop. Requests that are still in flight complete with
    ///  [ServiceError::LoopTerminated].
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            debug!("dispatch loop terminated already");
        }
    }
}

/// The network's handle for passing received frames to the dispatch loop
#[derive(Clone)]
pub struct IncomingSender {
    incoming: mpsc::Sender<IncomingFrame>,
}

#[async_trait]
impl FrameReceiver for IncomingSender {
    async fn on_received(&self, frame: IncomingFrame) {
        if self.incoming.send(frame).await.is_err() {
            debug!("dispatch loop terminated - dropping received frame");
        }
    }
}

fn execute(core: &mut TransportCore, command: Command) {
    match command {
        Command::SendConfirmed(request, sender) => core.send_confirmed(request, sender),
        Command::SendUnconfirmed { to, broadcast, service_choice, payload } => core.send_unconfirmed(to, broadcast, service_choice, payload),
        Command::Shutdown => {}
    }
}

/// Takes at most one command and one received frame per iteration so that neither side can
///  starve the other, and handles timeouts and delayed sends in between. When there is nothing
///  to do, it waits for the next command or frame, but at most `idle_sleep` so that deadlines
///  are noticed.
async fn dispatch_loop(mut core: TransportCore, mut commands: mpsc::Receiver<Command>, mut incoming: mpsc::Receiver<IncomingFrame>, idle_sleep: Duration) {
    info!("starting dispatch loop");

    loop {
        let mut busy = false;

        match commands.try_recv() {
            Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => break,
            Ok(command) => {
                busy = true;
                execute(&mut core, command);
            }
            Err(TryRecvError::Empty) => {}
        }

        if let Ok(frame) = incoming.try_recv() {
            busy = true;
            core.on_received(frame);
        }

        busy |= core.process_delayed();
        busy |= core.expire();
        core.publish_in_flight();

        if busy {
            continue;
        }

        select! {
            command = commands.recv() => match command {
                None | Some(Command::Shutdown) => break,
                Some(command) => execute(&mut core, command),
            },
            Some(frame) = incoming.recv() => core.on_received(frame),
            _ = time::sleep(idle_sleep) => trace!("idle"),
        }
    }

    info!("dispatch loop terminated");
    core.shutdown();
}
