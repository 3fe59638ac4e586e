// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use dmcat::*;

#[cfg(test)]
mod test;

// These tests live outside the library so that they can only use its public
// API, the way an embedding process would.

#[test]
fn replicated_commit_test() {
    test::replicated_commit_test();
}

#[test]
fn replay_resync_test() {
    test::replay_resync_test();
}

#[test]
fn full_copy_resync_test() {
    test::full_copy_resync_test();
}

#[test]
fn migration_test() {
    test::migration_test();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
