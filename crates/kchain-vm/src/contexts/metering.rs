//! Gas accounting for the current call frame.
//!
//! Consumption lives in the running instance (its "points"), so every
//! operation that reads or moves gas takes the [`ExecutionFrame`] it applies
//! to. The metering context keeps what the frame was given and what it paid
//! up front, and the gas each contract forwarded to nested calls.

use crate::config::FeatureFlags;
use crate::contexts::output::OutputContext;
use crate::error::VmError;
use crate::gas_schedule::GasSchedule;
use crate::state_stack::StateStack;
use kchain_types::{Address, CallType, VmInput};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;

/// The frame gas is charged to.
pub trait ExecutionFrame {
    fn points_used(&self) -> u64;
    fn set_points_used(&mut self, points: u64);
    fn sc_address(&self) -> &Address;
    fn sc_code_size(&self) -> u64;
}

/// Gas moved between contracts by nested calls during the transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContractGasState {
    pub forwarded: u64,
    /// Part of `forwarded` that came back through the contract
    pub returned: u64,
}

impl ContractGasState {
    pub fn net_forwarded(&self) -> u64 {
        self.forwarded.saturating_sub(self.returned)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MeteringSnapshot {
    initial_gas_provided: u64,
    initial_cost: u64,
    gas_for_execution: u64,
    gas_locked: u64,
}

#[derive(Debug)]
pub struct MeteringContext {
    schedule: OnceCell<Arc<GasSchedule>>,
    flags: FeatureFlags,
    block_gas_limit: u64,
    initial_gas_provided: u64,
    initial_cost: u64,
    gas_for_execution: u64,
    gas_locked: u64,
    total_used_gas: u64,
    gas_states: HashMap<Address, ContractGasState>,
    state_stack: Vec<MeteringSnapshot>,
}

impl MeteringContext {
    pub fn new(flags: FeatureFlags, block_gas_limit: u64) -> Self {
        Self {
            schedule: OnceCell::new(),
            flags,
            block_gas_limit,
            initial_gas_provided: 0,
            initial_cost: 0,
            gas_for_execution: 0,
            gas_locked: 0,
            total_used_gas: 0,
            gas_states: HashMap::new(),
            state_stack: Vec::new(),
        }
    }

    /// Select the gas schedule. Only the first selection takes effect, and
    /// only if no gas has been priced yet.
    pub fn set_gas_schedule(&self, schedule: Arc<GasSchedule>) -> bool {
        match self.schedule.set(schedule) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!("gas schedule already in use, ignoring the new one");
                false
            }
        }
    }

    pub fn gas_schedule(&self) -> &GasSchedule {
        self.schedule.get_or_init(|| Arc::new(GasSchedule::default()))
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    /// Take the gas of a new frame from its input.
    ///
    /// Gas locked for a callback becomes available when the callback runs.
    pub fn init_state_from_input(&mut self, input: &mut VmInput) {
        if input.call_type == CallType::AsynchronousCallBack {
            input.gas_provided = input.gas_provided.saturating_add(input.gas_locked);
            input.gas_locked = 0;
        }
        self.initial_gas_provided = input.gas_provided;
        self.gas_for_execution = input.gas_provided;
        self.gas_locked = input.gas_locked;
        self.initial_cost = 0;
    }

    pub fn deduct_initial_gas_for_execution(&mut self, code: &[u8]) -> Result<(), VmError> {
        let costs = &self.gas_schedule().base_operation_cost;
        let (base, per_byte) = if self.flags.aot_compile_enabled {
            (costs.get_code, costs.aot_prepare_per_byte)
        } else {
            (0, costs.compile_per_byte)
        };
        self.deduct_initial_gas(code.len() as u64, base, per_byte)
    }

    pub fn deduct_initial_gas_for_direct_deployment(&mut self, code: &[u8]) -> Result<(), VmError> {
        let schedule = self.gas_schedule();
        let base = schedule.base_ops_api_cost.create_contract;
        let per_byte = schedule.base_operation_cost.compile_per_byte;
        self.deduct_initial_gas(code.len() as u64, base, per_byte)
    }

    pub fn deduct_initial_gas_for_indirect_deployment(&mut self, code: &[u8]) -> Result<(), VmError> {
        let per_byte = self.gas_schedule().base_operation_cost.compile_per_byte;
        self.deduct_initial_gas(code.len() as u64, 0, per_byte)
    }

    fn deduct_initial_gas(&mut self, code_len: u64, base: u64, per_byte: u64) -> Result<(), VmError> {
        let cost = base.saturating_add(per_byte.saturating_mul(code_len));
        if cost > self.initial_gas_provided {
            return Err(VmError::NotEnoughGas);
        }
        self.initial_cost = cost;
        self.gas_for_execution = self.initial_gas_provided - cost;
        Ok(())
    }

    pub fn use_gas(&self, frame: &mut impl ExecutionFrame, gas: u64) {
        let used = frame.points_used();
        let total = used.checked_add(gas).unwrap_or_else(|| {
            tracing::error!(used, gas, "gas points overflow");
            u64::MAX
        });
        frame.set_points_used(total);
    }

    /// Give back gas, unless more is returned than was used.
    pub fn restore_gas(&self, frame: &mut impl ExecutionFrame, gas: u64) {
        let used = frame.points_used();
        if gas <= used {
            frame.set_points_used(used - gas);
        }
    }

    /// Add to the refund of the transaction.
    pub fn free_gas(&self, output: &mut OutputContext, gas: u64) {
        output.add_refund(gas);
    }

    pub fn gas_left(&self, frame: &impl ExecutionFrame) -> u64 {
        self.gas_for_execution.saturating_sub(frame.points_used())
    }

    pub fn is_out_of_gas(&self, frame: &impl ExecutionFrame) -> bool {
        frame.points_used() > self.gas_for_execution
    }

    /// Use gas only if strictly more than that is left.
    pub fn use_gas_bounded(&self, frame: &mut impl ExecutionFrame, gas: u64) -> Result<(), VmError> {
        if self.gas_left(frame) <= gas {
            return Err(VmError::NotEnoughGas);
        }
        self.use_gas(frame, gas);
        Ok(())
    }

    pub fn use_gas_for_async_step(&self, frame: &mut impl ExecutionFrame) -> Result<(), VmError> {
        let step = self.gas_schedule().base_ops_api_cost.async_call_step;
        self.use_gas_bounded(frame, step)
    }

    /// Cap a requested gas limit to the gas left.
    pub fn bound_gas_limit(&self, frame: &impl ExecutionFrame, limit: u64) -> u64 {
        limit.min(self.gas_left(frame))
    }

    /// Record gas that `source` passed on, to a nested frame or to an
    /// outgoing transfer, for the rest of the transaction.
    ///
    /// Gas sent to `source` itself, or to a contract further down the call
    /// stack, is coming back through `source` and is also recorded as
    /// returned to `destination`.
    pub fn forward_gas(
        &mut self,
        source: &Address,
        destination: Option<&Address>,
        gas: u64,
        destination_on_stack: bool,
    ) {
        let state = self.gas_states.entry(*source).or_default();
        state.forwarded = state.forwarded.saturating_add(gas);

        if let Some(destination) = destination {
            if destination == source || destination_on_stack {
                let state = self.gas_states.entry(*destination).or_default();
                state.returned = state.returned.saturating_add(gas);
            }
        }
    }

    pub fn gas_state(&self, address: &Address) -> ContractGasState {
        self.gas_states.get(address).copied().unwrap_or_default()
    }

    /// Gas charged to the current contract, net of what it forwarded.
    ///
    /// Returns the gas used and the forwarded gas left over when the
    /// contract forwarded more than it consumed.
    pub fn gas_used_by_contract(&self, frame: &impl ExecutionFrame) -> (u64, u64) {
        let spent = self.gas_spent_by_contract(frame);
        let forwarded = self.gas_state(frame.sc_address()).net_forwarded();
        if spent >= forwarded {
            (spent - forwarded, 0)
        } else {
            (0, forwarded - spent)
        }
    }

    pub fn gas_used_for_execution(&self, frame: &impl ExecutionFrame) -> u64 {
        let (used, _) = self.gas_used_by_contract(frame);
        used.saturating_sub(self.initial_cost)
    }

    /// Gas consumed by the frame, including its initial cost.
    pub fn gas_spent_by_contract(&self, frame: &impl ExecutionFrame) -> u64 {
        let points = frame.points_used();
        if self.flags.vm_v2_enabled {
            points.saturating_add(self.initial_cost)
        } else {
            points
        }
    }

    /// Gas to lock for the callback of an asynchronous call made by the
    /// current contract.
    pub fn compute_gas_locked_for_async(&self, frame: &impl ExecutionFrame) -> u64 {
        let schedule = self.gas_schedule();
        let per_byte = if self.flags.aot_compile_enabled {
            schedule.base_operation_cost.aot_prepare_per_byte
        } else {
            schedule.base_operation_cost.compile_per_byte
        };
        let compilation_lock = if self.flags.dynamic_gas_locking_enabled {
            frame.sc_code_size().saturating_mul(per_byte)
        } else {
            0
        };
        compilation_lock
            .saturating_add(schedule.base_ops_api_cost.async_callback_gas_lock)
            .saturating_add(schedule.base_ops_api_cost.async_call_step)
    }

    pub fn gas_provided(&self) -> u64 {
        self.initial_gas_provided
    }

    pub fn gas_for_execution(&self) -> u64 {
        self.gas_for_execution
    }

    pub fn initial_cost(&self) -> u64 {
        self.initial_cost
    }

    pub fn gas_locked(&self) -> u64 {
        self.gas_locked
    }

    pub fn block_gas_limit(&self) -> u64 {
        self.block_gas_limit
    }

    /// Gas already used by the transaction when the current frame started
    pub fn total_used_gas(&self) -> u64 {
        self.total_used_gas
    }

    pub fn set_total_used_gas(&mut self, gas: u64) {
        self.total_used_gas = gas;
    }
}

impl StateStack for MeteringContext {
    fn init_state(&mut self) {
        self.initial_gas_provided = 0;
        self.initial_cost = 0;
        self.gas_for_execution = 0;
        self.gas_locked = 0;
        self.total_used_gas = 0;
        self.gas_states.clear();
    }

    fn push_state(&mut self) {
        self.state_stack.push(MeteringSnapshot {
            initial_gas_provided: self.initial_gas_provided,
            initial_cost: self.initial_cost,
            gas_for_execution: self.gas_for_execution,
            gas_locked: self.gas_locked,
        });
    }

    fn pop_set_active_state(&mut self) {
        if let Some(snapshot) = self.state_stack.pop() {
            self.initial_gas_provided = snapshot.initial_gas_provided;
            self.initial_cost = snapshot.initial_cost;
            self.gas_for_execution = snapshot.gas_for_execution;
            self.gas_locked = snapshot.gas_locked;
        }
    }

    fn pop_discard(&mut self) {
        self.state_stack.pop();
    }

    fn clear_state_stack(&mut self) {
        self.state_stack.clear();
    }

    fn state_stack_len(&self) -> usize {
        self.state_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct TestFrame {
        points: u64,
        address: Address,
        code_size: u64,
    }

    impl TestFrame {
        fn new(address: Address) -> Self {
            Self {
                points: 0,
                address,
                code_size: 0,
            }
        }
    }

    impl ExecutionFrame for TestFrame {
        fn points_used(&self) -> u64 {
            self.points
        }
        fn set_points_used(&mut self, points: u64) {
            self.points = points;
        }
        fn sc_address(&self) -> &Address {
            &self.address
        }
        fn sc_code_size(&self) -> u64 {
            self.code_size
        }
    }

    fn flags(aot: bool) -> FeatureFlags {
        FeatureFlags {
            aot_compile_enabled: aot,
            ..Default::default()
        }
    }

    fn metering(aot: bool) -> MeteringContext {
        let metering = MeteringContext::new(flags(aot), 1_000_000);
        assert!(metering.set_gas_schedule(Arc::new(GasSchedule::uniform(1).unwrap())));
        metering
    }

    fn input(gas: u64) -> VmInput {
        VmInput {
            gas_provided: gas,
            ..Default::default()
        }
    }

    fn addr(b: u8) -> Address {
        Address::from_bytes([b; 32])
    }

    #[test]
    fn test_direct_deployment() {
        let mut metering = metering(false);
        metering.init_state_from_input(&mut input(10_000));
        metering.deduct_initial_gas_for_direct_deployment(&[0u8; 12]).unwrap();

        let frame = TestFrame::new(addr(1));
        assert_eq!(metering.gas_left(&frame), 10_000 - 12 - 1);

        metering.init_state_from_input(&mut input(2));
        assert_eq!(
            metering.deduct_initial_gas_for_direct_deployment(&[0u8; 12]),
            Err(VmError::NotEnoughGas)
        );
    }

    #[test]
    fn test_indirect_deployment() {
        let mut metering = metering(false);
        metering.init_state_from_input(&mut input(10_000));
        metering.deduct_initial_gas_for_indirect_deployment(&[0u8; 12]).unwrap();

        let frame = TestFrame::new(addr(1));
        assert_eq!(metering.gas_left(&frame), 10_000 - 12);
        assert_eq!(metering.initial_cost(), 12);
    }

    #[test]
    fn test_gas_used_no_stacking() {
        let mut metering = metering(true);
        let mut frame = TestFrame::new(addr(1));

        metering.init_state_from_input(&mut input(2_000));
        metering.deduct_initial_gas_for_execution(&[0u8; 1_000]).unwrap();
        assert_eq!(metering.gas_left(&frame), 999);

        metering.use_gas(&mut frame, 400);
        assert_eq!(metering.gas_left(&frame), 599);
        assert_eq!(metering.gas_used_by_contract(&frame), (1_401, 0));
        assert_eq!(metering.gas_used_for_execution(&frame), 400);
    }

    #[test]
    fn test_gas_used_stack_one_level() {
        let parent = addr(1);
        let child = addr(2);
        let mut metering = metering(true);
        let mut frame = TestFrame::new(parent);

        metering.init_state_from_input(&mut input(4_000));
        metering.deduct_initial_gas_for_execution(&[0u8; 1_000]).unwrap();
        metering.use_gas(&mut frame, 400);

        // Parent pays what it provides to the child, then switches frames
        metering.use_gas(&mut frame, 500);
        let parent_points = frame.points;
        metering.push_state();
        frame.address = child;
        frame.points = 0;

        metering.init_state_from_input(&mut input(500));
        metering.deduct_initial_gas_for_execution(&[0u8; 100]).unwrap();
        assert_eq!(metering.gas_left(&frame), 399);

        metering.use_gas(&mut frame, 50);
        assert_eq!(metering.gas_left(&frame), 349);
        let child_remaining = metering.gas_left(&frame);
        let child_spent = metering.gas_spent_by_contract(&frame);
        assert_eq!(metering.gas_used_by_contract(&frame), (151, 0));

        metering.pop_set_active_state();
        frame.address = parent;
        frame.points = parent_points;

        metering.restore_gas(&mut frame, child_remaining);
        metering.forward_gas(&parent, Some(&child), child_spent, false);
        assert_eq!(metering.gas_left(&frame), 2_448);
        assert_eq!(metering.gas_used_by_contract(&frame), (1_401, 0));

        metering.use_gas(&mut frame, 50);
        assert_eq!(metering.gas_left(&frame), 2_398);
        assert_eq!(metering.gas_used_by_contract(&frame), (1_451, 0));
    }

    #[test]
    fn test_self_forward_is_returned() {
        let a = addr(1);
        let mut metering = metering(false);
        let mut frame = TestFrame::new(a);
        metering.init_state_from_input(&mut input(1_000));
        metering.use_gas(&mut frame, 300);

        metering.forward_gas(&a, Some(&a), 100, false);
        assert_eq!(metering.gas_used_by_contract(&frame), (300, 0));
        assert_eq!(metering.gas_state(&a), ContractGasState { forwarded: 100, returned: 100 });
    }

    #[test]
    fn test_forwarded_gas_returning_through_stack() {
        let parent = addr(1);
        let child = addr(2);
        let mut metering = metering(false);
        let mut frame = TestFrame::new(parent);
        metering.init_state_from_input(&mut input(10_000));
        metering.use_gas(&mut frame, 1_000);

        metering.forward_gas(&parent, Some(&child), 100, false);
        assert_eq!(metering.gas_used_by_contract(&frame), (900, 0));
        assert_eq!(metering.gas_state(&child), ContractGasState::default());

        let parent_points = frame.points;
        metering.push_state();
        frame.address = child;
        frame.points = 0;
        metering.init_state_from_input(&mut input(500));
        metering.use_gas(&mut frame, 60);

        metering.forward_gas(&child, Some(&child), 0, true);
        metering.forward_gas(&child, Some(&child), 20, true);
        assert_eq!(metering.gas_used_by_contract(&frame), (60, 0));
        assert_eq!(metering.gas_state(&child), ContractGasState { forwarded: 20, returned: 20 });

        // The parent is further down the stack, so this gas comes back to it
        metering.forward_gas(&child, Some(&parent), 30, true);
        assert_eq!(metering.gas_used_by_contract(&frame), (30, 0));
        assert_eq!(metering.gas_state(&parent), ContractGasState { forwarded: 100, returned: 30 });

        metering.pop_set_active_state();
        frame.address = parent;
        frame.points = parent_points;
        assert_eq!(metering.gas_used_by_contract(&frame), (930, 0));
    }

    #[test]
    fn test_forwarded_more_than_spent() {
        let mut metering = metering(false);
        let mut frame = TestFrame::new(addr(1));
        metering.init_state_from_input(&mut input(1_000));
        metering.use_gas(&mut frame, 100);
        metering.forward_gas(&addr(1), None, 150, false);

        assert_eq!(metering.gas_used_by_contract(&frame), (0, 50));
    }

    #[test]
    fn test_use_gas_bounded() {
        let mut metering = metering(false);
        let mut frame = TestFrame::new(addr(1));
        metering.init_state_from_input(&mut input(100));

        assert_eq!(metering.use_gas_bounded(&mut frame, 100), Err(VmError::NotEnoughGas));
        assert_eq!(frame.points, 0);
        metering.use_gas_bounded(&mut frame, 99).unwrap();
        assert_eq!(metering.gas_left(&frame), 1);
    }

    #[test]
    fn test_restore_more_than_used_is_ignored() {
        let metering = metering(false);
        let mut frame = TestFrame::new(addr(1));
        metering.use_gas(&mut frame, 10);
        metering.restore_gas(&mut frame, 11);
        assert_eq!(frame.points, 10);
        metering.restore_gas(&mut frame, 10);
        assert_eq!(frame.points, 0);
    }

    #[test]
    fn test_gas_left_floors_at_zero() {
        let mut metering = metering(false);
        let mut frame = TestFrame::new(addr(1));
        metering.init_state_from_input(&mut input(10));
        metering.use_gas(&mut frame, 25);
        assert_eq!(metering.gas_left(&frame), 0);
        assert!(metering.is_out_of_gas(&frame));
        assert_eq!(metering.bound_gas_limit(&frame, 5), 0);
    }

    #[test]
    fn test_callback_unlocks_gas() {
        let mut metering = metering(false);
        let mut callback = VmInput {
            gas_provided: 1_000,
            gas_locked: 200,
            call_type: CallType::AsynchronousCallBack,
            ..Default::default()
        };
        metering.init_state_from_input(&mut callback);

        assert_eq!(callback.gas_provided, 1_200);
        assert_eq!(callback.gas_locked, 0);
        assert_eq!(metering.gas_provided(), 1_200);

        let mut call = VmInput {
            gas_provided: 1_000,
            gas_locked: 200,
            call_type: CallType::AsynchronousCall,
            ..Default::default()
        };
        metering.init_state_from_input(&mut call);
        assert_eq!(metering.gas_provided(), 1_000);
        assert_eq!(metering.gas_locked(), 200);
    }

    #[test]
    fn test_gas_locked_for_async() {
        let mut frame = TestFrame::new(addr(1));
        frame.code_size = 40;

        let dynamic = metering(false);
        assert_eq!(dynamic.compute_gas_locked_for_async(&frame), 40 + 1 + 1);

        let fixed = MeteringContext::new(
            FeatureFlags {
                dynamic_gas_locking_enabled: false,
                ..Default::default()
            },
            0,
        );
        let schedule = GasSchedule::default();
        let expected = schedule.base_ops_api_cost.async_callback_gas_lock + schedule.base_ops_api_cost.async_call_step;
        assert_eq!(fixed.compute_gas_locked_for_async(&frame), expected);
    }

    #[test]
    fn test_schedule_loads_once() {
        let metering = MeteringContext::new(FeatureFlags::default(), 0);
        assert_eq!(metering.gas_schedule(), &GasSchedule::default());
        assert!(!metering.set_gas_schedule(Arc::new(GasSchedule::uniform(3).unwrap())));
        assert_eq!(metering.gas_schedule().base_operation_cost.get_code, GasSchedule::default().base_operation_cost.get_code);
    }

    #[test]
    fn test_init_state_clears_gas_states() {
        let mut metering = metering(false);
        metering.forward_gas(&addr(1), None, 10, false);
        metering.push_state();
        metering.init_state();
        metering.clear_state_stack();
        assert_eq!(metering.gas_state(&addr(1)), ContractGasState::default());
        assert_eq!(metering.state_stack_len(), 0);
    }

    proptest! {
        #[test]
        fn prop_use_then_restore(provided in 0u64..1_000_000, used in 0u64..1_000_000) {
            let mut metering = metering(false);
            let mut frame = TestFrame::new(addr(1));
            metering.init_state_from_input(&mut input(provided));

            metering.use_gas(&mut frame, used);
            prop_assert!(metering.gas_left(&frame) <= metering.gas_for_execution());
            metering.restore_gas(&mut frame, used);
            prop_assert_eq!(metering.gas_left(&frame), provided);
        }
    }
}
