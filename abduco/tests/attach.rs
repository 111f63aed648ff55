// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multi-client behavior of the session server: fan-out, read-only
//! clients, primary promotion, and detach semantics.

use std::time::Duration;

use ntest::timeout;

use abduco_protocol::AttachFlags;

mod support;

use support::{WireClient, SessionDir};

#[test]
#[timeout(30000)]
fn output_fans_out_to_every_client() -> anyhow::Result<()> {
    let dir = SessionDir::new()?;
    let session = dir.spawn_session("fan", &["/bin/cat"])?;

    let mut first = WireClient::connect(&session.sock)?;
    first.attach()?;
    first.resize(24, 80)?;

    let mut second = WireClient::connect(&session.sock)?;
    second.attach()?;
    second.resize(24, 80)?;

    first.send(b"X\n")?;

    // cat's echo reaches both clients, not just the sender
    first.read_output_until(b"X")?;
    second.read_output_until(b"X")?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn read_only_input_never_reaches_the_child() -> anyhow::Result<()> {
    let dir = SessionDir::new()?;
    let session = dir.spawn_session("ro", &["/bin/cat"])?;

    let mut writer = WireClient::connect(&session.sock)?;
    writer.attach()?;
    writer.resize(24, 80)?;

    let mut reader = WireClient::connect(&session.sock)?;
    reader.attach_with(AttachFlags { read_only: true, low_priority: false })?;
    reader.resize(24, 80)?;

    reader.send(b"SECRET\n")?;
    writer.assert_no_output_containing(b"SECRET", Duration::from_millis(600));

    // the session is still healthy and the read-only client still
    // sees output from others
    writer.send(b"visible\n")?;
    writer.read_output_until(b"visible")?;
    reader.read_output_until(b"visible")?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn head_departure_asks_the_next_client_to_resize() -> anyhow::Result<()> {
    let dir = SessionDir::new()?;
    let session = dir.spawn_session("promote", &["/bin/cat"])?;

    let mut older = WireClient::connect(&session.sock)?;
    older.attach()?;
    older.resize(24, 80)?;

    // the most recent attacher is the primary client
    let mut newer = WireClient::connect(&session.sock)?;
    newer.attach()?;
    newer.resize(30, 100)?;

    // when the primary detaches, the promoted client is asked to
    // re-announce its window size
    newer.detach()?;
    older.wait_resize_request()?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn low_priority_clients_never_become_primary() -> anyhow::Result<()> {
    let dir = SessionDir::new()?;
    let session = dir.spawn_session("lowprio", &["/bin/cat"])?;

    let mut normal = WireClient::connect(&session.sock)?;
    normal.attach()?;
    normal.resize(24, 80)?;

    // connects after `normal`, but sinks itself to the tail on attach
    let mut observer = WireClient::connect(&session.sock)?;
    observer.attach_with(AttachFlags { read_only: false, low_priority: true })?;
    observer.resize(50, 200)?;

    // `normal` is still the head: detaching it promotes the observer
    normal.detach()?;
    observer.wait_resize_request()?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn detach_leaves_the_session_running() -> anyhow::Result<()> {
    let dir = SessionDir::new()?;
    let session = dir.spawn_session("sticky", &["/bin/cat"])?;

    let mut first = WireClient::connect(&session.sock)?;
    first.attach()?;
    first.resize(24, 80)?;
    first.send(b"A\n")?;
    first.read_output_until(b"A")?;

    first.detach()?;
    first.wait_closed()?;

    // the child is still there for the next client
    let mut second = WireClient::connect(&session.sock)?;
    second.attach()?;
    second.resize(24, 80)?;
    second.send(b"B\n")?;
    second.read_output_until(b"B")?;

    assert!(session.sock.exists());
    Ok(())
}

#[test]
#[timeout(30000)]
fn duplicate_attach_is_idempotent() -> anyhow::Result<()> {
    let dir = SessionDir::new()?;
    let session = dir.spawn_session("twice", &["/bin/cat"])?;

    let mut client = WireClient::connect(&session.sock)?;
    client.attach()?;
    client.attach()?;
    client.resize(24, 80)?;

    client.send(b"Z\n")?;
    client.read_output_until(b"Z")?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn late_attacher_sees_recent_output() -> anyhow::Result<()> {
    let dir = SessionDir::new()?;
    let session = dir.spawn_session("replayed", &["/bin/cat"])?;

    let mut first = WireClient::connect(&session.sock)?;
    first.attach()?;
    first.resize(24, 80)?;
    first.send(b"breadcrumb\n")?;
    first.read_output_until(b"breadcrumb")?;

    // a client attaching later gets the retained output replayed
    let mut second = WireClient::connect(&session.sock)?;
    second.attach()?;
    second.read_output_until(b"breadcrumb")?;

    Ok(())
}

#[test]
#[timeout(30000)]
fn exit_status_reaches_an_attached_client() -> anyhow::Result<()> {
    let dir = SessionDir::new()?;
    let session = dir.spawn_session("shortlived", &["/bin/sh", "-c", "sleep 0.3; exit 7"])?;

    let mut client = WireClient::connect(&session.sock)?;
    client.attach()?;
    client.resize(24, 80)?;

    assert_eq!(client.wait_exit()?, 7);

    let sock = session.sock.clone();
    support::wait_until("socket cleanup", || !sock.exists());
    Ok(())
}
