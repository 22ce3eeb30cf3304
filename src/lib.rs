// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod auth;
pub mod config;
pub mod connection_limit;
pub mod dispatcher;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod rate_limit;
pub mod session;
pub mod token_registry;
pub mod user_store;
