#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use node_agent_common::wire::Heartbeat;
use node_agent_common::{Channel, OutputBundle, OutputListener};
use node_agent_server::{listen, ProcessManager, SupervisorConfig};

#[derive(Default)]
pub struct Recorder {
    bundles: Mutex<Vec<OutputBundle>>,
    heartbeats: Mutex<Vec<Heartbeat>>,
}

impl Recorder {
    pub fn bundles(&self) -> Vec<OutputBundle> {
        self.bundles.lock().unwrap().clone()
    }

    pub fn channel(&self, channel: Channel) -> String {
        let mut out = Vec::new();
        for bundle in self.bundles() {
            bundle.buffer().write_channel_to(&mut out, channel).unwrap();
        }
        String::from_utf8(out).unwrap()
    }

    pub fn saw_destroyed(&self) -> bool {
        self.bundles().iter().any(|b| b.destroyed())
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.lock().unwrap().len()
    }
}

impl OutputListener for Recorder {
    fn handle_output_bundle(&self, bundle: &OutputBundle) -> anyhow::Result<()> {
        self.bundles.lock().unwrap().push(bundle.clone());
        Ok(())
    }

    fn handle_heartbeat(&self, heartbeat: &Heartbeat) -> anyhow::Result<()> {
        self.heartbeats.lock().unwrap().push(heartbeat.clone());
        Ok(())
    }
}

pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Serve a fresh node agent on an ephemeral loopback port.
pub fn start_agent(config: SupervisorConfig) -> u16 {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let manager = Arc::new(ProcessManager::new(config, BTreeMap::new()));
            let (addr, serve) = listen("127.0.0.1:0".parse().unwrap(), manager)
                .await
                .unwrap();
            tx.send(addr.port()).unwrap();
            serve.await;
        });
    });
    rx.recv_timeout(Duration::from_secs(10)).unwrap()
}
