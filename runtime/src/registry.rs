//! Subscriber registry: which handlers receive which request type.
//!
//! Each registration names one terminal handler and carries the ordering markers that
//! decorate it. Blocking and async registrations are kept in separate tables, so a
//! request can have a blocking handler for `send` and an async one for `send_async`.
//!
//! # Example
//!
//! ```
//! use courier_runtime::registry::{PipelineMode, SubscriberRegistry};
//! # use courier_core::prelude::*;
//! # struct PlaceOrder(RequestId);
//! # impl Request for PlaceOrder {
//! #     fn id(&self) -> RequestId { self.0 }
//! #     fn kind(&self) -> RequestKind { RequestKind::Command }
//! # }
//! # struct PlaceOrderHandler;
//! # struct LoggingHandler;
//! # struct ValidationHandler;
//!
//! let mut registry = SubscriberRegistry::new();
//! registry
//!     .register::<PlaceOrder, PlaceOrderHandler>()
//!     .before::<LoggingHandler>(1)
//!     .before::<ValidationHandler>(2);
//!
//! assert_eq!(registry.get::<PlaceOrder>(PipelineMode::Sync).len(), 1);
//! assert!(registry.get::<PlaceOrder>(PipelineMode::Async).is_empty());
//! ```

use courier_core::handler::{
    HandlerDescriptor, HandlerMarker, HandlerModality, HandlerTiming, HandlerType,
};
use courier_core::request::Request;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

/// Execution mode of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineMode {
    /// Blocking handlers on the caller's thread.
    Sync,
    /// Async handlers on the caller's runtime.
    Async,
}

impl PipelineMode {
    /// Whether a handler of `modality` can run in this mode.
    #[must_use]
    pub const fn accepts(self, modality: HandlerModality) -> bool {
        match self {
            Self::Sync => modality.supports_sync(),
            Self::Async => modality.supports_async(),
        }
    }

    /// Adjective used in error messages.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Sync => "synchronous",
            Self::Async => "asynchronous",
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A terminal handler and the markers declared on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    terminal: HandlerType,
    modality: HandlerModality,
    markers: Vec<HandlerMarker>,
}

impl Registration {
    fn new(terminal: HandlerType, modality: HandlerModality) -> Self {
        Self {
            terminal,
            modality,
            markers: Vec::new(),
        }
    }

    /// Terminal handler type.
    #[must_use]
    pub const fn terminal(&self) -> HandlerType {
        self.terminal
    }

    /// Modality of the terminal handler.
    #[must_use]
    pub const fn modality(&self) -> HandlerModality {
        self.modality
    }

    /// All markers in declaration order, foreign ones included.
    #[must_use]
    pub fn markers(&self) -> &[HandlerMarker] {
        &self.markers
    }

    /// Pipeline descriptors in declaration order; foreign markers are skipped.
    pub fn descriptors(&self) -> impl Iterator<Item = &HandlerDescriptor> {
        self.markers.iter().filter_map(HandlerMarker::descriptor)
    }
}

/// Adds markers to a registration just made.
///
/// Markers are recorded as each method is called; the builder can be dropped at any point.
#[derive(Debug)]
pub struct RegistrationBuilder<'r> {
    registration: &'r mut Registration,
}

#[allow(clippy::return_self_not_must_use)]
impl RegistrationBuilder<'_> {
    /// Run blocking decorator `D` before the terminal handler at `step`.
    pub fn before<D: 'static>(self, step: u32) -> Self {
        self.decorate::<D>(step, HandlerTiming::Before, HandlerModality::Sync)
    }

    /// Run blocking decorator `D` after the terminal handler at `step`.
    pub fn after<D: 'static>(self, step: u32) -> Self {
        self.decorate::<D>(step, HandlerTiming::After, HandlerModality::Sync)
    }

    /// Run async decorator `D` before the terminal handler at `step`.
    pub fn before_async<D: 'static>(self, step: u32) -> Self {
        self.decorate::<D>(step, HandlerTiming::Before, HandlerModality::Async)
    }

    /// Run async decorator `D` after the terminal handler at `step`.
    pub fn after_async<D: 'static>(self, step: u32) -> Self {
        self.decorate::<D>(step, HandlerTiming::After, HandlerModality::Async)
    }

    /// Add decorator `D` with an explicit timing and modality.
    pub fn decorate<D: 'static>(
        self,
        step: u32,
        timing: HandlerTiming,
        modality: HandlerModality,
    ) -> Self {
        self.marker(HandlerMarker::Pipeline(HandlerDescriptor::new::<D>(step, timing, modality)))
    }

    /// Attach any marker, including foreign ones.
    pub fn marker(self, marker: HandlerMarker) -> Self {
        self.registration.markers.push(marker);
        self
    }
}

#[derive(Debug, Default, Clone)]
struct Table {
    sync: Vec<Registration>,
    asynchronous: Vec<Registration>,
}

impl Table {
    fn mode(&self, mode: PipelineMode) -> &[Registration] {
        match mode {
            PipelineMode::Sync => &self.sync,
            PipelineMode::Async => &self.asynchronous,
        }
    }

    fn mode_mut(&mut self, mode: PipelineMode) -> &mut Vec<Registration> {
        match mode {
            PipelineMode::Sync => &mut self.sync,
            PipelineMode::Async => &mut self.asynchronous,
        }
    }
}

/// Handler registrations per request type, in registration order.
#[derive(Debug, Default, Clone)]
pub struct SubscriberRegistry {
    tables: HashMap<TypeId, Table>,
}

impl SubscriberRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register blocking handler `H` as a receiver of `R`.
    pub fn register<R: Request, H: 'static>(&mut self) -> RegistrationBuilder<'_> {
        self.push::<R>(PipelineMode::Sync, HandlerType::of::<H>(), HandlerModality::Sync)
    }

    /// Register async handler `H` as a receiver of `R`.
    pub fn register_async<R: Request, H: 'static>(&mut self) -> RegistrationBuilder<'_> {
        self.push::<R>(PipelineMode::Async, HandlerType::of::<H>(), HandlerModality::Async)
    }

    fn push<R: Request>(
        &mut self,
        mode: PipelineMode,
        terminal: HandlerType,
        modality: HandlerModality,
    ) -> RegistrationBuilder<'_> {
        let registrations = self.tables.entry(TypeId::of::<R>()).or_default().mode_mut(mode);
        registrations.push(Registration::new(terminal, modality));
        let index = registrations.len() - 1;
        RegistrationBuilder {
            registration: &mut registrations[index],
        }
    }

    /// Registrations for `R` in `mode`, in registration order.
    #[must_use]
    pub fn get<R: Request>(&self, mode: PipelineMode) -> &[Registration] {
        self.tables
            .get(&TypeId::of::<R>())
            .map_or(&[][..], |table| table.mode(mode))
    }

    /// Number of handlers registered for `R` in `mode`.
    #[must_use]
    pub fn handler_count<R: Request>(&self, mode: PipelineMode) -> usize {
        self.get::<R>(mode).len()
    }
}
