//! Block-at-a-time value operators.
//!
//! Every operator consumes whole argument columns and produces one
//! result column; there is no row-at-a-time evaluation path. The
//! [`Expression`] type sequences operators over a block the way the
//! interpreter layer lowers a WHERE/SELECT list.

mod arithmetic;
mod comparison;
mod expression;
mod function;
mod misc;
mod set;
mod tuple_fn;

pub use arithmetic::{ArithmeticFunction, ArithmeticOp};
pub use comparison::{ComparisonFunction, ComparisonOp};
pub use expression::{Expression, ExpressionAction};
pub use function::{Function, FunctionRegistry};
pub use misc::{ArrayJoinMarker, Bar, CurrentDatabase, HostName, VisibleWidth};
pub use set::{set_from_block, InSet, Set, SetInsertOutcome, SetLimits, SetRowOutcome};
pub use tuple_fn::{TupleElementFunction, TupleFunction};
