//! RAII checkout guards.
//!
//! A [`CheckoutGuard`] gives one external thread exclusive, mutable access
//! to a registered producer.  While it is held the tick skips that producer;
//! dropping the guard checks the producer back in.
//!
//! [`TypedCheckout`] is the same guard, already downcast to the concrete
//! producer type.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use motionmux_types::{MotionId, MuxError};
use parking_lot::RawRwLock;
use parking_lot::lock_api::ArcRwLockWriteGuard;

use crate::motion::MotionCommand;

pub(crate) type MotionGuard = ArcRwLockWriteGuard<RawRwLock, Box<dyn MotionCommand>>;

/// Exclusive access to one producer.  Dropping the guard checks it back in.
pub struct CheckoutGuard {
    id: MotionId,
    guard: MotionGuard,
    flag: Arc<AtomicBool>,
}

impl CheckoutGuard {
    pub(crate) fn new(id: MotionId, guard: MotionGuard, flag: Arc<AtomicBool>) -> Self {
        Self { id, guard, flag }
    }

    /// Handle of the checked-out producer.
    pub fn id(&self) -> MotionId {
        self.id
    }

    /// Downcast into a typed guard.  On mismatch the guard is handed back
    /// untouched alongside the error.
    pub fn downcast<T: MotionCommand>(self) -> Result<TypedCheckout<T>, (Self, MuxError)> {
        if self.producer().as_any().is::<T>() {
            Ok(TypedCheckout {
                inner: self,
                _marker: PhantomData,
            })
        } else {
            let err = MuxError::TypeMismatch {
                id: self.id,
                expected: std::any::type_name::<T>().to_string(),
            };
            Err((self, err))
        }
    }

    fn producer(&self) -> &(dyn MotionCommand + 'static) {
        &**self.guard
    }

    fn producer_mut(&mut self) -> &mut (dyn MotionCommand + 'static) {
        &mut **self.guard
    }
}

impl Deref for CheckoutGuard {
    type Target = dyn MotionCommand;

    fn deref(&self) -> &Self::Target {
        self.producer()
    }
}

impl DerefMut for CheckoutGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.producer_mut()
    }
}

impl Drop for CheckoutGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        tracing::trace!(motion = %self.id, "checked in");
    }
}

impl std::fmt::Debug for CheckoutGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutGuard")
            .field("id", &self.id)
            .field("name", &self.producer().name())
            .finish()
    }
}

/// A [`CheckoutGuard`] whose producer is known to be a `T`.
pub struct TypedCheckout<T: MotionCommand> {
    inner: CheckoutGuard,
    _marker: PhantomData<fn() -> T>,
}

impl<T: MotionCommand> TypedCheckout<T> {
    pub fn id(&self) -> MotionId {
        self.inner.id
    }

    /// Give up the type information, keeping the checkout.
    pub fn into_untyped(self) -> CheckoutGuard {
        self.inner
    }
}

impl<T: MotionCommand> Deref for TypedCheckout<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.inner.producer().as_any().downcast_ref::<T>() {
            Some(producer) => producer,
            None => unreachable!("producer type verified at checkout"),
        }
    }
}

impl<T: MotionCommand> DerefMut for TypedCheckout<T> {
    fn deref_mut(&mut self) -> &mut T {
        match self.inner.producer_mut().as_any_mut().downcast_mut::<T>() {
            Some(producer) => producer,
            None => unreachable!("producer type verified at checkout"),
        }
    }
}
