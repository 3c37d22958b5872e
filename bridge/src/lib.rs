// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod account;
pub mod bridge_info;
pub mod config;
pub mod contract;
pub mod error;
pub mod eth;
pub mod event_handler;
pub mod handle_store;
pub mod journal;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod recovery;
pub mod sorted_map;
pub mod types;

#[cfg(test)]
pub mod test_utils;
