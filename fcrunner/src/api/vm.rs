use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use fcrunner_protocol::{
    Ack, CommandOutput, CreateVmRequest, CreateVmResponse, SendClientCommandRequest,
    SendCommandRequest, TrackSyscallsRequest, VmInfo,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{body, internal_error, invalid_request, ok_response, vm_error_response, AppState};
use crate::network::BridgeAddress;
use crate::util::HostCommand;
use crate::vm::{kill_hypervisors, VmSpec};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/vm/create", post(create_vm))
        .route("/vm/command", post(send_command))
        .route("/vm/client-command", post(send_client_command))
        .route("/vm/syscalls/track", post(track_syscalls))
        .route("/vm/syscalls/stop", post(stop_syscalls))
        .route("/vm/cleanup", post(cleanup))
}

fn parse_ip(ip: &str) -> Result<Ipv4Addr, Response> {
    ip.trim()
        .parse()
        .map_err(|_| invalid_request(format!("invalid VM IP address: {:?}", ip)))
}

async fn create_vm(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateVmRequest>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let ip = match parse_ip(&req.ip) {
        Ok(ip) => ip,
        Err(resp) => return resp,
    };
    if req.kernel_path.is_empty() || req.rootfs_path.is_empty() {
        return invalid_request("kernel_path and rootfs_path are required");
    }

    // Guests route through the bridge that was set up, or the configured
    // bridge address if setup has not run on this agent.
    let bridge = {
        let network = state.network.lock().await;
        network.address()
    };
    let bridge = match bridge {
        Some(address) => address,
        None => {
            let net = &state.config.network;
            match BridgeAddress::new(net.bridge_ip, net.subnet_prefix) {
                Ok(address) => address,
                Err(e) => return internal_error(&e),
            }
        }
    };

    let spec = VmSpec {
        ip,
        kernel_path: PathBuf::from(&req.kernel_path),
        rootfs_path: PathBuf::from(&req.rootfs_path),
        gateway: bridge.ip(),
        netmask: bridge.netmask(),
    };

    let vms = state.vms().await;
    match vms.create_vm(spec).await {
        Ok(vm) => {
            vms.log_networking_info().await;
            ok_response(CreateVmResponse {
                vm: VmInfo {
                    ip: vm.ip.to_string(),
                    kernel_path: vm.kernel_path.to_string_lossy().into_owned(),
                    rootfs_path: vm.rootfs_path.to_string_lossy().into_owned(),
                },
            })
        }
        Err(e) => vm_error_response(e),
    }
}

async fn send_command(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendCommandRequest>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let ip = match parse_ip(&req.ip) {
        Ok(ip) => ip,
        Err(resp) => return resp,
    };

    match state.vms().await.send_command(ip, &req.command, req.wait).await {
        Ok(()) => ok_response(Ack::default()),
        Err(e) => vm_error_response(e),
    }
}

async fn send_client_command(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SendClientCommandRequest>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let ip = match parse_ip(&req.ip) {
        Ok(ip) => ip,
        Err(resp) => return resp,
    };

    match state.vms().await.send_client_command(ip, &req.command).await {
        Ok(()) => ok_response(CommandOutput::finished()),
        Err(e) => vm_error_response(e),
    }
}

async fn track_syscalls(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TrackSyscallsRequest>, JsonRejection>,
) -> Response {
    let req = match body(payload) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let vms = state.vms().await;
    match req.ip {
        Some(ip) => {
            let ip = match parse_ip(&ip) {
                Ok(ip) => ip,
                Err(resp) => return resp,
            };
            if let Err(e) = vms.track_syscalls_for(ip).await {
                return vm_error_response(e);
            }
        }
        None => {
            let started = vms.track_all_syscalls().await;
            info!(started, "tracking syscalls of VMs");
        }
    }
    ok_response(Ack::default())
}

async fn stop_syscalls(State(state): State<Arc<AppState>>) -> Response {
    state.vms().await.stop_syscalls().await;
    ok_response(Ack::default())
}

/// Kill every hypervisor on the host and start over with an empty registry.
async fn cleanup(State(state): State<Arc<AppState>>) -> Response {
    let host = HostCommand::new(state.config.network.command_prefix.clone());
    match kill_hypervisors(&host, &state.config.vm.firecracker_binary).await {
        Ok(true) => info!("killed firecracker processes"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "failed to kill firecracker processes"),
    }

    let old = match state.replace_vms().await {
        Ok(old) => old,
        Err(e) => return internal_error(&e),
    };
    if let Err(e) = old.shutdown(&CancellationToken::new()).await {
        warn!(error = %e, "previous VM manager did not shut down cleanly");
    }
    info!("VM manager reset");
    ok_response(Ack::default())
}
