#![allow(unused_imports)]

//! Database models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::db::models::*;` work across the crate.

pub mod alert;
pub mod dnd;
pub mod escalation;
pub mod incident;
pub mod notification;
pub mod organization;
pub mod routing_rule;
pub mod schedule;
pub mod user;
pub mod webhook;

pub use self::alert::*;
pub use self::dnd::*;
pub use self::escalation::*;
pub use self::incident::*;
pub use self::notification::*;
pub use self::organization::*;
pub use self::routing_rule::*;
pub use self::schedule::*;
pub use self::user::*;
pub use self::webhook::*;
