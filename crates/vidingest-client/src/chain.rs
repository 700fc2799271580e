//! Ordered callback chains and first-supplier-wins aggregate slots.
//!
//! A [`CallbackChain`] keeps a bounded, ordered list of implementations for a
//! category where several implementations cooperate on every call. An
//! [`AggregateSlot`] folds partial implementations into one: for each
//! operation the first registration that supplies it wins.
//!
//! Both resolve "who supplies which operation" at registration time, so an
//! invocation only walks the implementations that actually take part.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{ClientError, ClientResult};

/// Upper bound on members of any chain or aggregate slot.
pub const MAX_CALLBACK_CHAIN_COUNT: usize = 20;
/// Chain capacity used when none is configured.
pub const DEFAULT_CALLBACK_CHAIN_COUNT: usize = 5;

/// An operation within one callback category.
pub trait Operation: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every operation, ordered by [`index`](Self::index).
    const ALL: &'static [Self];

    /// Dense index in `0..ALL.len()`.
    fn index(self) -> usize;
}

/// The operations one implementation supplies.
pub struct OpSet<O> {
    bits: u64,
    _marker: PhantomData<O>,
}

impl<O: Operation> OpSet<O> {
    /// Set supplying nothing.
    pub fn empty() -> Self {
        Self {
            bits: 0,
            _marker: PhantomData,
        }
    }

    /// Set supplying every operation of the category.
    pub fn all() -> Self {
        Self::of(O::ALL)
    }

    /// Set supplying exactly `ops`.
    pub fn of(ops: &[O]) -> Self {
        ops.iter().fold(Self::empty(), |set, op| set.with(*op))
    }

    /// This set plus `op`.
    pub fn with(self, op: O) -> Self {
        Self {
            bits: self.bits | (1 << op.index()),
            _marker: PhantomData,
        }
    }

    /// Whether `op` is in the set.
    pub fn contains(&self, op: O) -> bool {
        self.bits & (1 << op.index()) != 0
    }

    /// Whether no operation is supplied.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Operations in the set, in category order.
    pub fn iter(&self) -> impl Iterator<Item = O> + '_ {
        O::ALL.iter().copied().filter(move |op| self.contains(*op))
    }
}

impl<O> Clone for OpSet<O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for OpSet<O> {}

impl<O> PartialEq for OpSet<O> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<O> Eq for OpSet<O> {}

impl<O: Operation> fmt::Debug for OpSet<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// What a chain member asks the invocation loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFlow {
    /// Go on to the next member.
    Continue,
    /// Suppress the remaining members for this invocation only.
    StopChain,
}

/// Return type of every chained callback.
pub type CallbackResult = ClientResult<ChainFlow>;

/// Summary of one chained invocation.
#[derive(Debug)]
pub struct ChainInvocation {
    /// Members reached, including the one that stopped the chain.
    pub invoked: usize,
    /// Whether a member returned [`ChainFlow::StopChain`].
    pub stopped: bool,
    /// First failure reported by any member reached.
    pub first_error: Option<ClientError>,
}

impl ChainInvocation {
    /// The first member failure, if any.
    pub fn into_result(self) -> ClientResult<()> {
        match self.first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Entry<T: ?Sized, O> {
    implementation: Arc<T>,
    ops: OpSet<O>,
}

fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Bounded, ordered list of cooperating implementations.
pub struct CallbackChain<T: ?Sized, O: Operation> {
    entries: Vec<Entry<T, O>>,
    by_op: Vec<Vec<usize>>,
    capacity: usize,
}

impl<T: ?Sized, O: Operation> CallbackChain<T, O> {
    /// Create an empty chain holding at most `capacity` members.
    pub fn with_capacity(capacity: usize) -> ClientResult<Self> {
        if capacity == 0 || capacity > MAX_CALLBACK_CHAIN_COUNT {
            return Err(ClientError::invalid_arg(format!(
                "callback chain capacity {} outside 1..={}",
                capacity, MAX_CALLBACK_CHAIN_COUNT
            )));
        }
        Ok(Self {
            entries: Vec::with_capacity(capacity),
            by_op: vec![Vec::new(); O::ALL.len()],
            capacity,
        })
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain has no members.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of members.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this exact object is already a member.
    pub fn contains(&self, implementation: &Arc<T>) -> bool {
        self.entries
            .iter()
            .any(|e| same_object(&e.implementation, implementation))
    }

    /// Append a member. Fails with `InvalidArg` once the chain is full; the
    /// existing members are left untouched.
    pub fn push(&mut self, implementation: Arc<T>, ops: OpSet<O>) -> ClientResult<()> {
        if self.entries.len() >= self.capacity {
            return Err(ClientError::invalid_arg(format!(
                "callback chain is full ({} members)",
                self.capacity
            )));
        }
        let position = self.entries.len();
        for op in ops.iter() {
            self.by_op[op.index()].push(position);
        }
        self.entries.push(Entry {
            implementation,
            ops,
        });
        Ok(())
    }

    /// Whether any member supplies `op`.
    pub fn supports(&self, op: O) -> bool {
        !self.by_op[op.index()].is_empty()
    }

    /// Run `f` on every member supplying `op`, in registration order.
    ///
    /// A member's failure is recorded and the walk continues; only
    /// [`ChainFlow::StopChain`] ends it early.
    pub fn invoke<F>(&self, op: O, mut f: F) -> ChainInvocation
    where
        F: FnMut(&T) -> CallbackResult,
    {
        let mut outcome = ChainInvocation {
            invoked: 0,
            stopped: false,
            first_error: None,
        };
        for &position in &self.by_op[op.index()] {
            let entry = &self.entries[position];
            outcome.invoked += 1;
            match f(entry.implementation.as_ref()) {
                Ok(ChainFlow::Continue) => {}
                Ok(ChainFlow::StopChain) => {
                    outcome.stopped = true;
                    break;
                }
                Err(err) => {
                    if outcome.first_error.is_none() {
                        outcome.first_error = Some(err);
                    }
                }
            }
        }
        outcome
    }

    /// Members in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries.iter().map(|e| &e.implementation)
    }

    /// Operations the member at `position` supplies.
    pub fn ops_of(&self, position: usize) -> Option<OpSet<O>> {
        self.entries.get(position).map(|e| e.ops)
    }
}

/// Single logical implementation assembled from partial registrations.
pub struct AggregateSlot<T: ?Sized, O: Operation> {
    registrations: Vec<Entry<T, O>>,
    resolved: Vec<Option<Arc<T>>>,
}

impl<T: ?Sized, O: Operation> Default for AggregateSlot<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized, O: Operation> AggregateSlot<T, O> {
    /// Slot with no registrations.
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            resolved: vec![None; O::ALL.len()],
        }
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Whether this exact object is already registered.
    pub fn contains(&self, implementation: &Arc<T>) -> bool {
        self.registrations
            .iter()
            .any(|e| same_object(&e.implementation, implementation))
    }

    /// Add a partial implementation and re-resolve every operation.
    pub fn register(&mut self, implementation: Arc<T>, ops: OpSet<O>) -> ClientResult<()> {
        if self.registrations.len() >= MAX_CALLBACK_CHAIN_COUNT {
            return Err(ClientError::invalid_arg(format!(
                "aggregate slot is full ({} registrations)",
                MAX_CALLBACK_CHAIN_COUNT
            )));
        }
        self.registrations.push(Entry {
            implementation,
            ops,
        });
        for op in O::ALL {
            self.resolved[op.index()] = self
                .registrations
                .iter()
                .find(|e| e.ops.contains(*op))
                .map(|e| Arc::clone(&e.implementation));
        }
        Ok(())
    }

    /// The implementation that won `op`, if any registration supplies it.
    pub fn resolve(&self, op: O) -> Option<&Arc<T>> {
        self.resolved[op.index()].as_ref()
    }

    /// Like [`resolve`](Self::resolve), falling back to `default`.
    pub fn resolve_or<'a>(&'a self, op: O, default: &'a T) -> &'a T {
        match self.resolve(op) {
            Some(winner) => winner.as_ref(),
            None => default,
        }
    }

    /// Registrations in order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.registrations.iter().map(|e| &e.implementation)
    }
}
