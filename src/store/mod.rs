pub mod account;
pub mod db;

pub use account::{Account, AccountKind, AccountPatch, AccountStore, NewAccount};
