// Copyright 2026 Labelscan Contributors
// SPDX-License-Identifier: Apache-2.0

//! Labelscan library — energy-label compliance scanning for marketplace
//! product pages.
//!
//! The pipeline renders each target URL in a single shared headless
//! Chromium session, classifies the rendered markup against three
//! structural label markers, and aggregates per-target results under
//! bounded concurrency with pacing, retry, and pause/stop control.

pub mod app;
pub mod classify;
pub mod cli;
pub mod config;
pub mod events;
pub mod fetch;
pub mod job;
pub mod rest;
pub mod session;
pub mod target;
