//! vbs-bus - Shared CAN/J1708 transceiver runtime
//!
//! This crate arbitrates one physical transceiver between named bus
//! consumers, discovers the CAN bitrate, and moves frames between the
//! hardware and the rest of the system.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    VehicleBusService                        │
//! │                                                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  CanBus     │  │  J1708Bus   │  │ Persistence/Sink    │  │
//! │  │ (discovery) │  │             │  │ (state, events)     │  │
//! │  └──────┬──────┘  └──────┬──────┘  └─────────────────────┘  │
//! │         │    BusWorkerPair (rx/tx threads, FrameQueue)      │
//! │         └────────┬───────┘                                  │
//! │         ┌────────┴────────┐        ┌──────────────┐         │
//! │         │BusResourceManager│──────►│ Dispatcher   │         │
//! │         │ (one socket)    │        │ (callbacks,  │         │
//! │         └────────┬────────┘        │  timers)     │         │
//! │         ┌────────┴────────┐        └──────────────┘         │
//! │         │HardwareTransport│                                 │
//! │         │(SocketCAN/mock) │                                 │
//! │         └─────────────────┘                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod can;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod j1708;
pub mod manager;
pub mod queue;
pub mod service;
pub mod sink;
pub mod state;
pub mod transport;
pub mod worker;

pub use can::{CanBus, CanStartRequest};
pub use config::{DiscoveryConfig, PortConfig, TransportConfig, VbsConfig};
pub use discovery::{DiscoveryController, DiscoveryStage};
pub use dispatcher::{Dispatcher, TimerHandle};
pub use j1708::J1708Bus;
pub use manager::{BusCallback, BusResourceManager};
pub use queue::FrameQueue;
pub use service::{can_request_from_port, VehicleBusService};
pub use sink::BroadcastSink;
pub use state::{FileStateStore, MemoryStateStore, PersistenceGateway, StateKey};
pub use transport::{create_transport, BusSocket, HardwareTransport, TransportError};
pub use worker::{BusWorkerPair, FrameHandler, WorkerState};

// Re-export for convenience
pub use vbs_core::{
    BusEvent, BusKind, BusStatus, FlowControlRecord, Frame, FrameType, HardwareFilter, VbsError,
    VbsResult,
};
