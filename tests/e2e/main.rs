//! End-to-end tests driving drakefile-style programs against temporary
//! work trees.

mod dyndeps;
mod failures;
