#![cfg(unix)]

mod cli_tests;
mod common;
mod once_tests;
