// Copyright (c) The testtrack Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod config;
pub mod cooccurrence;
pub mod dag;
pub mod errors;
pub mod executor;
pub mod lifecycle;
pub mod log_parser;
pub mod measurement_store;
pub mod regression_selector;
pub mod sprt;
pub mod status_store;
pub mod verdict;
