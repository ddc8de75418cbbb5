//! The operator trait and the name registry.

use std::collections::HashMap;
use std::sync::Arc;

use strata_column::{Column, ColumnWithTypeAndName};
use strata_error::{Result, StrataError};
use strata_types::DataType;

/// One value-level operator, executed block-at-a-time.
pub trait Function: Send + Sync {
    fn name(&self) -> &str;

    /// Result type for the given argument types; rejects bad signatures.
    fn return_type(&self, args: &[DataType]) -> Result<DataType>;

    /// Evaluate over `rows` rows. Arguments arrive in call order; the
    /// result column must have exactly `rows` rows (constants included).
    fn execute(&self, args: &[&ColumnWithTypeAndName], rows: usize) -> Result<Column>;
}

/// Name → operator lookup used by the expression executor.
///
/// Stateful operators (`in` with a prepared set, `currentDatabase` with
/// its context) are constructed directly and injected per expression;
/// only stateless operators live here.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn Function>>,
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with every stateless built-in registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        use crate::arithmetic::{ArithmeticFunction, ArithmeticOp};
        use crate::comparison::{ComparisonFunction, ComparisonOp};
        use crate::misc::{ArrayJoinMarker, Bar, HostName, VisibleWidth};
        use crate::tuple_fn::{TupleElementFunction, TupleFunction};

        let mut registry = Self::new();
        for op in [
            ArithmeticOp::Plus,
            ArithmeticOp::Minus,
            ArithmeticOp::Multiply,
            ArithmeticOp::Divide,
            ArithmeticOp::Modulo,
            ArithmeticOp::Negate,
        ] {
            registry.register(Arc::new(ArithmeticFunction::new(op)));
        }
        for op in [
            ComparisonOp::Equals,
            ComparisonOp::NotEquals,
            ComparisonOp::Less,
            ComparisonOp::Greater,
            ComparisonOp::LessOrEquals,
            ComparisonOp::GreaterOrEquals,
        ] {
            registry.register(Arc::new(ComparisonFunction::new(op)));
        }
        registry.register(Arc::new(TupleFunction));
        registry.register(Arc::new(TupleElementFunction));
        registry.register(Arc::new(ArrayJoinMarker));
        registry.register(Arc::new(Bar));
        registry.register(Arc::new(HostName));
        registry.register(Arc::new(VisibleWidth));
        registry
    }

    pub fn register(&mut self, function: Arc<dyn Function>) {
        self.functions.insert(function.name().to_string(), function);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Function>> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::UnknownFunction {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_resolve() {
        let registry = FunctionRegistry::with_builtins();
        for name in ["plus", "equals", "tuple", "tupleElement", "bar", "visibleWidth"] {
            assert!(registry.get(name).is_ok(), "missing builtin {name}");
        }
        assert!(registry.get("no_such_fn").is_err());
    }
}
