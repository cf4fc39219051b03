//! Masked level-signal bus.
//!
//! A producer publishes a 32-bit value on one of its output pins. Every
//! subscription on that pin delivers `(signal, value, mask)` to its
//! consumer, in the order the subscriptions were made. The consumer
//! merges `value & mask` into its own state and decides for itself
//! whether an edge happened.
//!
//! Subscriptions are made while building the machine and frozen by
//! [`crate::MachineBuilder::build`], so propagation always walks a
//! snapshot.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::component::{Component, ComponentId};
use crate::machine::Ctx;

/// An output pin of a producer. Implemented by a closed enum per chip.
pub trait OutputPin: Copy + fmt::Debug + 'static {
    fn index(self) -> u8;
}

/// A component that accepts signals.
pub trait SignalInput: Component {
    /// Closed set of signal ids this component understands.
    type Signal: Copy + fmt::Debug + 'static;

    fn write_signal(&mut self, ctx: &mut Ctx<'_>, signal: Self::Signal, data: u32, mask: u32);
}

/// A component that publishes signals.
pub trait SignalOutput: Component {
    type Output: OutputPin;
}

type Deliver = Box<dyn Fn(&mut dyn Component, &mut Ctx<'_>, u32)>;

/// One consumer of one output pin.
pub(crate) struct Subscription {
    pub(crate) target: ComponentId,
    description: String,
    deliver: Deliver,
}

impl Subscription {
    pub(crate) fn deliver(&self, device: &mut dyn Component, ctx: &mut Ctx<'_>, value: u32) {
        (self.deliver)(device, ctx, value);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

type Route = (ComponentId, u8);

/// Subscriptions under construction.
#[derive(Default)]
pub(crate) struct SignalTableBuilder {
    routes: HashMap<Route, Vec<Rc<Subscription>>>,
}

impl SignalTableBuilder {
    pub(crate) fn subscribe<C: SignalInput>(
        &mut self,
        producer: ComponentId,
        pin: impl OutputPin,
        target: ComponentId,
        signal: C::Signal,
        mask: u32,
    ) {
        let description = format!("{producer}:{pin:?} -> {target}:{signal:?} & {mask:#010X}");
        let deliver: Deliver = Box::new(
            move |device: &mut dyn Component, ctx: &mut Ctx<'_>, value: u32| {
                if let Some(consumer) = device.as_any_mut().downcast_mut::<C>() {
                    consumer.write_signal(ctx, signal, value, mask);
                }
            },
        );
        log::trace!("signal route {description}");
        self.routes
            .entry((producer, pin.index()))
            .or_default()
            .push(Rc::new(Subscription {
                target,
                description,
                deliver,
            }));
    }

    pub(crate) fn freeze(self) -> SignalTable {
        SignalTable {
            routes: self
                .routes
                .into_iter()
                .map(|(route, subs)| (route, Rc::from(subs)))
                .collect(),
        }
    }
}

/// Frozen subscription table.
#[derive(Default)]
pub(crate) struct SignalTable {
    routes: HashMap<Route, Rc<[Rc<Subscription>]>>,
}

impl SignalTable {
    /// Snapshot of the subscribers of `(producer, pin)`.
    pub(crate) fn subscribers(&self, producer: ComponentId, pin: u8) -> Option<Rc<[Rc<Subscription>]>> {
        self.routes.get(&(producer, pin)).map(Rc::clone)
    }

    pub(crate) fn is_connected(&self, producer: ComponentId, pin: u8) -> bool {
        self.routes.contains_key(&(producer, pin))
    }
}
