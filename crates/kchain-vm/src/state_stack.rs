/// Snapshot discipline shared by every execution context.
///
/// A nested call pushes the state of each context, runs, and then either
/// restores the snapshot, discards it, or (for output) merges into it.
/// After a top-level call every stack must be empty again.
pub trait StateStack {
    /// Reset the active state for a new top-level call.
    fn init_state(&mut self);

    fn push_state(&mut self);

    /// Restore the most recent snapshot. A no-op on an empty stack.
    fn pop_set_active_state(&mut self);

    /// Drop the most recent snapshot, keeping the active state.
    fn pop_discard(&mut self);

    fn clear_state_stack(&mut self);

    fn state_stack_len(&self) -> usize;
}
