//! A host implementing the fiber runtime that transformed functions call into.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use super::{Host, Reference, Trap, Value};
use crate::transform::RuntimeNames;
use crate::transform::codec::Routine;

/// The runtime state of one fiber: the saved values and the two protocol flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fiber {
    pub values: Vec<Value>,
    /// Set by the scheduler before re-running a suspended function.
    pub resuming: bool,
    /// Set by a suspending host function; transformed code unwinds while it is set.
    pub suspending: bool,
    /// When cleared, suspending host functions complete immediately.
    pub can_suspend: bool,
}

impl Fiber {
    pub fn new() -> Self {
        Self {
            can_suspend: true,
            ..Self::default()
        }
    }
}

pub type HostFunction = Box<dyn FnMut(&mut Fiber, &[Value]) -> Result<Vec<Value>, Trap>>;

/// Answers the fiber routines and dispatches every other import to a registered function.
pub struct FiberHost {
    pub fiber: Fiber,
    names: RuntimeNames,
    functions: HashMap<String, HostFunction>,
    calls: Vec<(String, Vec<Value>)>,
}

impl fmt::Debug for FiberHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHost")
            .field("fiber", &self.fiber)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .field("calls", &self.calls)
            .finish()
    }
}

impl FiberHost {
    pub fn new(names: RuntimeNames) -> Self {
        Self {
            fiber: Fiber::new(),
            names,
            functions: HashMap::new(),
            calls: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        name: &str,
        function: impl FnMut(&mut Fiber, &[Value]) -> Result<Vec<Value>, Trap> + 'static,
    ) {
        self.functions.insert(name.to_string(), Box::new(function));
    }

    /// Calls made to registered functions, in order. Calls replayed while resuming are left out.
    pub fn calls(&self) -> &[(String, Vec<Value>)] {
        &self.calls
    }

    fn routine(&mut self, routine: Routine, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let fiber = &mut self.fiber;
        Ok(match routine {
            Routine::Current => vec![Value::Ref(Reference::Host(0))],
            Routine::IsResuming => vec![Value::from_bool(fiber.resuming)],
            Routine::IsSuspending => vec![Value::from_bool(fiber.suspending)],
            Routine::Push(_) => {
                let value = args.first().copied().ok_or(Trap::StackUnderflow)?;
                fiber.values.push(value);
                Vec::new()
            }
            Routine::Pop(_) => {
                let value = fiber
                    .values
                    .pop()
                    .ok_or_else(|| Trap::Host("fiber has no saved values".to_string()))?;
                vec![value]
            }
        })
    }
}

impl Host for FiberHost {
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Trap> {
        if let Some(routine) = self.names.routine(name) {
            return self.routine(routine, args);
        }
        let function = self
            .functions
            .get_mut(name)
            .ok_or_else(|| Trap::UnknownImport(name.to_string()))?;
        if !self.fiber.resuming {
            self.calls.push((name.to_string(), args.to_vec()));
        }
        function(&mut self.fiber, args)
    }
}

/// A host function that suspends the fiber on its first call and completes when resumed.
///
/// While suspending it returns `placeholder`. On resume, `complete` receives the arguments of
/// the call that suspended.
pub fn suspending(
    mut complete: impl FnMut(&[Value]) -> Vec<Value> + 'static,
    placeholder: Vec<Value>,
) -> impl FnMut(&mut Fiber, &[Value]) -> Result<Vec<Value>, Trap> + 'static {
    let mut pending: Option<Vec<Value>> = None;
    move |fiber, args| {
        if !fiber.can_suspend {
            return Ok(complete(args));
        }
        if fiber.resuming {
            fiber.resuming = false;
            let args = pending
                .take()
                .ok_or_else(|| Trap::Host("resumed a call that never suspended".to_string()))?;
            return Ok(complete(&args));
        }
        debug!("suspending fiber");
        pending = Some(args.to_vec());
        fiber.suspending = true;
        Ok(placeholder.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspends_then_completes_with_saved_arguments() {
        let mut host = FiberHost::new(RuntimeNames::default());
        host.register(
            "env.wait",
            suspending(|args| vec![args[0]], vec![Value::I32(0)]),
        );

        let first = host.call("env.wait", &[Value::I32(7)]).unwrap();
        assert_eq!(first, vec![Value::I32(0)]);
        assert!(host.fiber.suspending);

        host.fiber.suspending = false;
        host.fiber.resuming = true;
        let second = host.call("env.wait", &[Value::I32(0)]).unwrap();
        assert_eq!(second, vec![Value::I32(7)]);
        assert!(!host.fiber.resuming);
        assert_eq!(host.calls().len(), 1);
    }

    #[test]
    fn routines_use_the_value_stack() {
        let names = RuntimeNames::default();
        let push = names.name(Routine::Push(crate::transform::codec::ValueCategory::Long));
        let pop = names.name(Routine::Pop(crate::transform::codec::ValueCategory::Long));
        let (push, pop) = (push.to_string(), pop.to_string());
        let mut host = FiberHost::new(names);
        let fiber = Value::Ref(Reference::Host(0));
        host.call(&push, &[Value::I64(5), fiber]).unwrap();
        assert_eq!(host.call(&pop, &[fiber]), Ok(vec![Value::I64(5)]));
        assert!(host.call(&pop, &[fiber]).is_err());
    }
}
