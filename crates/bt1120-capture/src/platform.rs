//! Platform collaborators: clock gate and shared interrupt line

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::CaptureError;

/// Functional clock of the capture block
pub trait ClockControl: Send + Sync {
    fn enable(&self) -> Result<(), CaptureError>;
    fn disable(&self);
}

/// Clock gate that only records its state
#[derive(Debug, Default)]
pub struct SimClock {
    enabled: AtomicBool,
    enables: AtomicU32,
}

impl SimClock {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number of enable calls so far
    pub fn enable_count(&self) -> u32 {
        self.enables.load(Ordering::Relaxed)
    }
}

impl ClockControl for SimClock {
    fn enable(&self) -> Result<(), CaptureError> {
        self.enabled.store(true, Ordering::Release);
        self.enables.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}

/// Interrupt handler verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The device did not raise this interrupt
    None,
    Handled,
}

/// Handler attached to an interrupt line. Runs in interrupt context: must
/// not block or sleep.
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self) -> IrqReturn;
}

/// Interrupt line shared by several on-chip peripherals; every handler is
/// offered every interrupt.
#[derive(Default)]
pub struct SharedIrqLine {
    handlers: Mutex<Vec<(String, Arc<dyn IrqHandler>)>>,
}

impl SharedIrqLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn IrqHandler>) {
        let name = name.into();
        debug!("IRQ handler registered: {}", name);
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((name, handler));
    }

    /// Deliver one interrupt to all handlers
    pub fn dispatch(&self) -> IrqReturn {
        let handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
        let mut result = IrqReturn::None;
        for (name, handler) in handlers.iter() {
            if handler.handle_irq() == IrqReturn::Handled {
                trace!("IRQ handled by {}", name);
                result = IrqReturn::Handled;
            }
        }
        result
    }
}
