//! Release-agent helper.
//!
//! The kernel invokes this binary when the last task exits a per-app freezer
//! cgroup, passing the group's path relative to the hierarchy root (e.g.
//! "/myapp"). The app name is the path's last component; it is forwarded to
//! the supervisor as a datagram on the well-known stop socket.
//!
//! The kernel runs the agent with an empty environment, so the socket path
//! is fixed; a deployment with a non-default runtime directory needs a
//! wrapper script that passes the socket path as a second argument.

use std::path::Path;
use std::process::exit;

const DEFAULT_STOP_SOCKET: &str = "/run/appvisor/app-stop.sock";

fn main() {
    let mut args = std::env::args().skip(1);

    let Some(cgroup_path) = args.next() else {
        eprintln!("usage: appvisor-stop-agent <cgroup-path> [socket-path]");
        exit(1);
    };
    let socket = args.next().unwrap_or_else(|| DEFAULT_STOP_SOCKET.to_string());

    let Some(app_name) = Path::new(&cgroup_path).file_name().and_then(|n| n.to_str()) else {
        eprintln!("appvisor-stop-agent: no app name in cgroup path '{cgroup_path}'");
        exit(1);
    };

    if let Err(e) = appvisor_sys::notify_app_stopped(Path::new(&socket), app_name) {
        eprintln!("appvisor-stop-agent: could not notify supervisor: {e}");
        exit(1);
    }
}
