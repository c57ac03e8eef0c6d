//! The device manager's worker.
//!
//! A single task owns the scan controller and the connection state machine.
//! Commands from the public handle, hardware callbacks and completions of
//! background tasks share one queue and are processed one at a time in the
//! order they were sent, so state transitions and registry mutations never
//! interleave or reorder.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::backend::{HardwareEvent, WriteMode};
use crate::ble::connection::ConnectionMachine;
use crate::ble::scanner::ScanController;
use crate::error::{Error, Result};

/// Request from the public handle.
pub(crate) enum Command {
    StartScan(oneshot::Sender<Result<()>>),
    StopScan(oneshot::Sender<()>),
    Connect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect(oneshot::Sender<()>),
    Read {
        uuid: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
    Write {
        uuid: Uuid,
        data: Bytes,
        mode: WriteMode,
        reply: oneshot::Sender<Result<()>>,
    },
    SetNotify {
        uuid: Uuid,
        enable: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Replies once every input queued before it has been handled.
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Completion of a background task spawned by the worker.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    ScanStartFailed { session: u64, error: Error },
    ScanTimedOut { session: u64 },
    ConnectCallFailed { attempt: u64, error: Error },
}

/// Everything the worker reacts to, in one FIFO queue.
pub(crate) enum Input {
    Command(Command),
    Hardware(HardwareEvent),
    Task(TaskEvent),
    /// The public handle was dropped without a shutdown.
    Closed,
}

pub(crate) struct Worker {
    scan: ScanController,
    connection: ConnectionMachine,
    inputs: mpsc::UnboundedReceiver<Input>,
}

impl Worker {
    pub(crate) fn new(
        scan: ScanController,
        connection: ConnectionMachine,
        inputs: mpsc::UnboundedReceiver<Input>,
    ) -> Self {
        Self {
            scan,
            connection,
            inputs,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Device manager worker started");

        // The backend and background tasks hold senders too, so the queue
        // never drains to `None` while they live.
        while let Some(input) = self.inputs.recv().await {
            match input {
                Input::Command(command) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Input::Hardware(event) => self.handle_hardware(event).await,
                Input::Task(event) => self.handle_task(event).await,
                Input::Closed => {
                    debug!("Device manager handle dropped");
                    self.cleanup().await;
                    break;
                }
            }
        }

        debug!("Device manager worker stopped");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartScan(reply) => {
                let result = self.scan.start().await;
                let _ = reply.send(result);
            }
            Command::StopScan(reply) => {
                self.scan.stop().await;
                let _ = reply.send(());
            }
            Command::Connect { address, reply } => {
                let known = self.scan.device(&address).cloned();
                let result = self.connection.connect(&address, known).await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                if self.connection.address().is_some() {
                    self.scan.stop().await;
                }
                self.connection.disconnect().await;
                let _ = reply.send(());
            }
            Command::Read { uuid, reply } => {
                let result = self.connection.read(uuid).await;
                let _ = reply.send(result);
            }
            Command::Write {
                uuid,
                data,
                mode,
                reply,
            } => {
                let result = self.connection.write(uuid, data, mode).await;
                let _ = reply.send(result);
            }
            Command::SetNotify {
                uuid,
                enable,
                reply,
            } => {
                let result = self.connection.set_notify(uuid, enable).await;
                let _ = reply.send(result);
            }
            Command::Flush(reply) => {
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                self.cleanup().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_hardware(&mut self, event: HardwareEvent) {
        match event {
            HardwareEvent::Advertisement(advertisement) => {
                self.scan.on_advertisement(advertisement);
            }
            HardwareEvent::ScanFailed { code } => {
                self.scan.on_scan_failed(code);
            }
            HardwareEvent::LinkStateChanged {
                link,
                address,
                state,
                status,
            } => {
                self.connection
                    .on_link_state(link, &address, state, status)
                    .await;
            }
            HardwareEvent::ServicesDiscovered { status, services } => {
                self.connection
                    .on_services_discovered(status, services)
                    .await;
            }
            HardwareEvent::CharacteristicRead {
                uuid,
                status,
                value,
            } => {
                self.connection.on_read(uuid, status, value).await;
            }
            HardwareEvent::CharacteristicWritten { uuid, status } => {
                self.connection.on_written(uuid, status).await;
            }
            HardwareEvent::CharacteristicChanged { uuid, value } => {
                self.connection.on_changed(uuid, value);
            }
            HardwareEvent::DescriptorWritten {
                characteristic,
                descriptor,
                status,
            } => {
                self.connection
                    .on_descriptor_written(characteristic, descriptor, status)
                    .await;
            }
        }
    }

    async fn handle_task(&mut self, event: TaskEvent) {
        trace!("Task event: {:?}", event);
        match event {
            TaskEvent::ScanStartFailed { session, error } => {
                self.scan.on_start_failed(session, error);
            }
            TaskEvent::ScanTimedOut { session } => {
                self.scan.on_timeout(session).await;
            }
            TaskEvent::ConnectCallFailed { attempt, error } => {
                self.connection.on_connect_call_failed(attempt, error).await;
            }
        }
    }

    async fn cleanup(&mut self) {
        info!("Shutting down device manager");
        self.scan.stop().await;
        self.connection.shutdown().await;
    }
}
