pub mod diagnostic_op;
pub mod inspect_op;
pub mod op_helper;
pub mod record_op;
