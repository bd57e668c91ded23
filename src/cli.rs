//! Command-line surface. Parsing and help text are handled entirely by
//! `clap`; the engine only ever sees the typed `Args`.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "jail", about = "Launch a process inside fresh Linux namespaces")]
pub struct Args {
    /// Add a mount: `bind:SRC:DST`, `bind-ro:SRC:DST`, `overlay:UPPER:DST:WORK`, `tmp:DST`.
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    /// Add a network interface: `DEV,NAME`, `macvlan,MASTER,NAME`, `ipvlan,MASTER,NAME`, `veth,HOSTEND,CONTEND`.
    #[arg(long = "netif")]
    pub netifs: Vec<String>,

    /// User to become inside the container.
    #[arg(long = "user", default_value = "root")]
    pub user: String,

    /// Add an id map entry: `container_id:host_id:count`.
    #[arg(long = "user-map")]
    pub user_maps: Vec<String>,

    /// Use this directory as the new root.
    #[arg(long = "chroot")]
    pub chroot: Option<String>,

    /// Overlay `/` on a tmpfs for the duration of the session.
    #[arg(long = "ephemeral")]
    pub ephemeral: bool,

    /// Change to this directory after chrooting.
    #[arg(long = "chdir")]
    pub chdir: Option<String>,

    /// Create and enroll in a cgroup controller; repeatable.
    #[arg(long = "cgroup")]
    pub cgroups: Vec<String>,

    /// Capability action sequence, e.g. `-all,+net_bind_service`.
    #[arg(long = "caps")]
    pub caps: Option<String>,

    /// Daemonize and serve the master pty over an abstract socket.
    #[arg(long = "detach")]
    pub detach: bool,

    /// Attach to a detached session by pid.
    #[arg(long = "attach")]
    pub attach: Option<i32>,

    /// Set an environment variable: `KEY=VALUE`; repeatable.
    #[arg(long = "setenv")]
    pub setenv: Vec<String>,

    /// Do not clear the environment when chrooting.
    #[arg(long = "keepenv")]
    pub keepenv: bool,

    /// Set the container's hostname.
    #[arg(long = "hostname")]
    pub hostname: Option<String>,

    #[arg(long = "no-userns")]
    pub no_userns: bool,
    #[arg(long = "no-mountns")]
    pub no_mountns: bool,
    #[arg(long = "no-netns")]
    pub no_netns: bool,
    #[arg(long = "no-ipcns")]
    pub no_ipcns: bool,
    #[arg(long = "no-utsns")]
    pub no_utsns: bool,
    #[arg(long = "no-pidns")]
    pub no_pidns: bool,

    /// The command to run inside the jail, and its arguments.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}
