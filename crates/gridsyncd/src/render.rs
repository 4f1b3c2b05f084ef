//! Indented text rendering of a [`Snapshot`].

use std::fmt::Write;

use gridsync_registry::{AdapterSnapshot, Snapshot};

pub fn render_tree(snapshot: &Snapshot) -> String {
    let mut out = String::new();

    if !snapshot.registries.is_empty() {
        out.push_str("registries\n");
        for registry in &snapshot.registries {
            let _ = writeln!(out, "  {}", registry.name);
        }
    }

    if !snapshot.applications.is_empty() {
        out.push_str("applications\n");
        for app in &snapshot.applications {
            let _ = writeln!(out, "  {} (revision {})", app.name, app.revision);
        }
    }

    out.push_str("nodes\n");
    for node in &snapshot.nodes {
        let state = if node.up { "up" } else { "down" };
        let _ = write!(out, "  {} [{state}]", node.name);
        if let Some(load) = node.load {
            let _ = write!(out, " load {:.2} {:.2} {:.2}", load.avg1, load.avg5, load.avg15);
        }
        out.push('\n');

        for server in &node.servers {
            let _ = write!(out, "    {} [{}]", server.id, server.state);
            if server.pid != 0 {
                let _ = write!(out, " pid {}", server.pid);
            }
            if !server.enabled {
                out.push_str(" disabled");
            }
            let _ = writeln!(out, " ({})", server.application);
            render_adapters(&mut out, &server.adapters, 6);

            for service in server.services.iter().flatten() {
                let started = if service.started { "started" } else { "stopped" };
                let _ = writeln!(out, "      {} [{started}]", service.name);
                render_adapters(&mut out, &service.adapters, 8);
            }
        }
    }
    out
}

fn render_adapters(out: &mut String, adapters: &[AdapterSnapshot], indent: usize) {
    for adapter in adapters {
        let _ = write!(out, "{:indent$}{}", "", adapter.name);
        if let Some(endpoint) = &adapter.endpoint {
            let _ = write!(out, " -> {endpoint}");
        }
        out.push('\n');
    }
}
