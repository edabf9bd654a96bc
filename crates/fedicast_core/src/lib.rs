/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Federation core: signed delivery, per-domain failure tracking, fan-out into
//! feeds and the status update/merge protocol.

pub mod activity;
pub mod api;
pub mod config;
pub mod delivery;
pub mod delivery_queue;
pub mod distribution;
pub mod error;
pub mod failure_tracker;
pub mod fan_out;
pub mod feed_store;
pub mod http_sig;
pub mod inbox;
pub mod keys;
pub mod lease_lock;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod net_guard;
pub mod notify;
pub mod render;
pub mod request;
pub mod runtime;
pub mod social_db;
pub mod status_update;
pub mod streaming;
