// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: TCP accept loop spawning one handler thread per client connection.
// Author: Lukas Bower

use std::fs;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::cleanup::spawn_cleanup_worker;
use crate::config::ProxyConfig;
use crate::handler::ConnectionHandler;
use crate::session::DeviceFactory;
use crate::target::TargetRegistry;

/// Listening proxy.
pub struct ProxyServer {
    listener: TcpListener,
    registry: Arc<TargetRegistry>,
}

impl ProxyServer {
    /// Bind to `config.server.listen` and start the cleanup worker.
    pub fn bind(config: ProxyConfig, factory: Arc<dyn DeviceFactory>) -> Result<Self> {
        fs::create_dir_all(&config.server.shared_root).with_context(|| {
            format!(
                "failed to create shared root {}",
                config.server.shared_root.display()
            )
        })?;
        let listener = TcpListener::bind(config.server.listen.as_str())
            .with_context(|| format!("failed to bind {}", config.server.listen))?;
        let cleanup = spawn_cleanup_worker(config.server.queue_depth)
            .context("failed to start cleanup worker")?;
        let registry = Arc::new(TargetRegistry::new(Arc::new(config), factory, cleanup));
        Ok(Self { listener, registry })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read listener address")
    }

    /// Shared target registry.
    pub fn registry(&self) -> Arc<TargetRegistry> {
        Arc::clone(&self.registry)
    }

    /// Accept connections forever.
    pub fn serve(self) -> Result<()> {
        info!(
            "[devfarm] listening on {} for targets {:?}",
            self.local_addr()?,
            self.registry.config().targets.keys().collect::<Vec<_>>()
        );
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => self.spawn_handler(stream),
                Err(err) => warn!("[devfarm] accept failed: {err}"),
            }
        }
        Ok(())
    }

    fn spawn_handler(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_owned());
        if let Err(err) = stream.set_nodelay(true) {
            warn!("[devfarm][conn {peer}] failed to set TCP_NODELAY: {err}");
        }
        info!("[devfarm][conn {peer}] accepted");
        let registry = Arc::clone(&self.registry);
        let spawned = thread::Builder::new()
            .name(format!("devfarm-conn-{peer}"))
            .spawn(move || ConnectionHandler::new(stream, peer, registry).run());
        if let Err(err) = spawned {
            warn!("[devfarm] failed to spawn connection thread: {err}");
        }
    }
}
