//! Tests for the tide-pipeline crate.

mod helpers;

mod shutdown;
