//! Unit tests for the service implementations

mod checker;
mod cleaner;
mod registry;
