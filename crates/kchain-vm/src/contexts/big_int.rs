//! Big integers held by the host on behalf of contracts, addressed by handle.

use crate::state_stack::StateStack;
use crate::vmhooks::BigIntHandle;
use num_bigint::BigInt;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct BigIntContext {
    values: HashMap<BigIntHandle, BigInt>,
    state_stack: Vec<HashMap<BigIntHandle, BigInt>>,
}

impl BigIntContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new value and return its handle.
    pub fn put(&mut self, value: impl Into<BigInt>) -> BigIntHandle {
        let mut handle = self.values.len() as BigIntHandle;
        while self.values.contains_key(&handle) {
            handle += 1;
        }
        self.values.insert(handle, value.into());
        handle
    }

    /// Value behind `handle`; unknown handles start out as zero.
    pub fn get_one(&mut self, handle: BigIntHandle) -> &mut BigInt {
        self.values.entry(handle).or_default()
    }

    pub fn get_two(&mut self, a: BigIntHandle, b: BigIntHandle) -> (BigInt, BigInt) {
        (self.get_one(a).clone(), self.get_one(b).clone())
    }

    pub fn get_three(&mut self, a: BigIntHandle, b: BigIntHandle, c: BigIntHandle) -> (BigInt, BigInt, BigInt) {
        (self.get_one(a).clone(), self.get_one(b).clone(), self.get_one(c).clone())
    }

    pub fn set(&mut self, handle: BigIntHandle, value: BigInt) {
        self.values.insert(handle, value);
    }
}

impl StateStack for BigIntContext {
    fn init_state(&mut self) {
        self.values.clear();
    }

    fn push_state(&mut self) {
        self.state_stack.push(self.values.clone());
    }

    fn pop_set_active_state(&mut self) {
        if let Some(values) = self.state_stack.pop() {
            self.values = values;
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

    #[test]
    fn test_handles() {
        let mut big_ints = BigIntContext::new();
        let a = big_ints.put(40);
        let b = big_ints.put(2);
        assert_eq!((a, b), (0, 1));

        let (x, y) = big_ints.get_two(a, b);
        big_ints.set(a, x + y);
        assert_eq!(big_ints.get_one(a), &BigInt::from(42));
        assert_eq!(big_ints.get_one(17), &BigInt::from(0));
    }

    #[test]
    fn test_nested_frames_are_isolated() {
        let mut big_ints = BigIntContext::new();
        let a = big_ints.put(1);

        big_ints.push_state();
        big_ints.init_state();
        assert_eq!(big_ints.put(9), 0);
        big_ints.pop_set_active_state();

        assert_eq!(big_ints.get_one(a), &BigInt::from(1));
        assert_eq!(big_ints.state_stack_len(), 0);
    }
}
