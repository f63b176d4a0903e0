//! Test fixtures and scripted mock agents for Convoy integration tests.
//!
//! - [`fixtures`]: a temp data root with the standard layout, plus item and
//!   git-repository builders with safe placeholder values.
//! - [`mocks`]: a shell-script stand-in for the assistant binary. One
//!   dispatcher is installed per test process; each agent picks up a
//!   role-specific behavior script from its working directory, so parallel
//!   tests never fight over environment variables.

pub mod fixtures;
pub mod mocks;

pub use fixtures::{git_checkout_new_branch, init_git_repo, ItemBuilder, TestBed};
pub use mocks::{
    dev_behavior, install_mock_agent, one_fix_review_behavior, passing_review_behavior,
    plan_writing_behavior, write_behavior, MockRole,
};
