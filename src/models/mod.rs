pub mod attempt;
pub mod evidence;
pub mod exam;
pub mod security_event;
pub mod tenant;
