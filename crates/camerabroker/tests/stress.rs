// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Concurrent connects from many clients with random priorities.

mod common;

use camerabroker::backend::VirtualDevice;
use camerabroker::session::SessionProtocol;
use camerabroker::{DeviceStatus, Error};
use common::{app, init_logger, Fixture, RecordingClient};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_test::serial;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DEVICES: [&str; 3] = ["0", "1", "2"];
const THREADS: u64 = 8;
const ROUNDS: usize = 25;

#[test]
#[serial]
fn test_concurrent_connects_keep_invariants() {
    init_logger();
    let fx = Arc::new(Fixture::new(vec![
        VirtualDevice::new("0").with_cost(50),
        VirtualDevice::new("1").with_cost(50),
        VirtualDevice::new("2").with_cost(50).with_conflicts(["0"]),
    ]));
    for pid in 1..=6 {
        fx.process(pid, pid * 10);
    }

    let done = Arc::new(AtomicBool::new(false));
    let checker = {
        let fx = Arc::clone(&fx);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let sup = fx.ctx.supervisor();
            let max_cost = sup.max_cost();
            let mut samples = 0usize;
            while !done.load(Ordering::SeqCst) {
                let leases = sup.leases();
                let online: Vec<&str> = leases
                    .iter()
                    .filter(|l| !l.offline)
                    .map(|l| l.device_id.as_str())
                    .collect();
                let unique: HashSet<&str> = online.iter().copied().collect();
                assert_eq!(unique.len(), online.len(), "{:?}", leases);
                assert!(leases.iter().map(|l| l.cost).sum::<i32>() <= max_cost, "{:?}", leases);
                assert!(!(unique.contains("0") && unique.contains("2")), "{:?}", leases);
                for id in DEVICES {
                    assert!(fx.backend.open_sessions(id) <= 1);
                }
                samples += 1;
                thread::sleep(Duration::from_micros(200));
            }
            samples
        })
    };

    let workers: Vec<_> = (0..THREADS)
        .map(|seed| {
            let fx = Arc::clone(&fx);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let sup = fx.ctx.supervisor();
                let mut opened = 0usize;
                for _ in 0..ROUNDS {
                    let device = DEVICES[rng.random_range(0..DEVICES.len())];
                    let pid = rng.random_range(1..=6);
                    match sup.connect(
                        device,
                        app(pid),
                        SessionProtocol::Modern,
                        RecordingClient::new().as_callbacks(),
                    ) {
                        Ok(session) => {
                            opened += 1;
                            thread::sleep(Duration::from_millis(rng.random_range(0..3)));
                            session.disconnect();
                        }
                        Err(Error::CameraInUse(_))
                        | Err(Error::MaxCamerasInUse(_))
                        | Err(Error::Timeout(_)) => {}
                        Err(e) => panic!("unexpected connect error: {}", e),
                    }
                }
                opened
            })
        })
        .collect();

    let opened: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    done.store(true, Ordering::SeqCst);
    let samples = checker.join().unwrap();

    assert!(opened > 0);
    assert!(samples > 0);
    let sup = fx.ctx.supervisor();
    assert!(sup.leases().is_empty(), "{:?}", sup.leases());
    for id in DEVICES {
        assert_eq!(sup.status(id), DeviceStatus::Present);
        assert_eq!(fx.backend.open_sessions(id), 0);
    }
    assert_eq!(fx.backend.opens(), fx.backend.closes());
}
