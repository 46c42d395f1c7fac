//! The per-process session: unfurl, measure, launch, rendezvous, wait.
//!
//! A spawn process is root when `SPAWN_PARENT` is absent from its
//! environment; otherwise it connects back to that address, identifies
//! itself, and receives the parameter map its parent holds. From there
//! every node behaves the same: launch children, accept them, forward
//! parameters, then run the application phases in lockstep with the
//! rest of the tree under signal waves.

use std::time::Instant;

use rustc_hash::FxHashMap;

use grove_common::{Result, SpawnError, StrMap};
use grove_net::{tcp, wire, Channel, Endpoint, Transport};

use crate::config::{self, ENV_ID, ENV_PARENT, KEY_MPIR_APP, KEY_MPIR_SPAWN};
use crate::group::{GroupId, GroupRegistry};
use crate::launch;
use crate::mpir;
use crate::pmi;
use crate::reaper::Reaper;
use crate::ring;
use crate::timing::{elapsed_ns, Phase};
use crate::tree::SpawnTree;

/// Labels for the unfurl steps fed into the critical-path reduction.
const UNFURL_LABELS: [&str; 6] = [
    "parent connect",
    "parent params",
    "launcher copy",
    "children launch",
    "children connect",
    "children params",
];

/// Wall-clock cost of each unfurl step on this node, in nanoseconds,
/// index-aligned with [`UNFURL_LABELS`].
type UnfurlTimes = [u64; 6];

/// One spawn process's state for the lifetime of the job.
pub struct Session {
    /// Parent endpoint address; `None` makes this the root.
    parent_addr: Option<String>,
    /// Rank string handed down by the parent (`SPAWN_ID`).
    spawn_id: Option<String>,
    /// The endpoint children and app procs connect to.
    endpoint: Endpoint,
    /// Launch parameters: built from the environment at the root,
    /// received from the parent everywhere else.
    params: StrMap,
    /// Application parameters, validated at startup. Root only; every
    /// other node receives them over the tree.
    app_template: Option<StrMap>,
    /// Process groups started by this spawn process.
    groups: GroupRegistry,
}

impl Session {
    /// Build the session from the environment and the CLI host list.
    ///
    /// `hosts` and `argv0` are only meaningful at the root; non-root
    /// processes get everything from their parent.
    pub fn init(hosts: &[String], argv0: &str) -> Result<Session> {
        let parent_addr = std::env::var(ENV_PARENT).ok();
        let spawn_id = std::env::var(ENV_ID).ok();

        let (endpoint, params, app_template) = match &parent_addr {
            Some(addr) => {
                // Match the parent's transport for our own endpoint.
                let kind = Transport::infer(addr)?;
                (Endpoint::open(kind)?, StrMap::new(), None)
            }
            None => {
                let debugged = mpir::being_debugged();
                if debugged {
                    mpir::set_i_am_starter();
                }
                let own_host = tcp::local_hostname()?;
                let params = config::root_params(&own_host, hosts, argv0, debugged)?;
                // Validate the application environment up front too: a
                // bad value must fail the job before anything forks.
                let app = config::app_params()?;
                let endpoint = Endpoint::open(config::net_kind()?)?;
                println!("Spawn parameters map:");
                print!("{params}");
                println!();
                (endpoint, params, Some(app))
            }
        };

        Ok(Session {
            parent_addr,
            spawn_id,
            endpoint,
            params,
            app_template,
            groups: GroupRegistry::new(),
        })
    }

    /// Rank of this spawn process: `SPAWN_ID`, or 0 at the root.
    fn rank(&self) -> Result<usize> {
        match &self.spawn_id {
            None => Ok(0),
            Some(id) => id.parse().map_err(|_| {
                SpawnError::config(format!("{ENV_ID} must be a rank, got `{id}`"))
            }),
        }
    }

    /// Run the whole session: unfurl the tree, run the measurement and
    /// application phases, and wait for every child to exit.
    pub fn run(&mut self) -> Result<()> {
        let mut times: UnfurlTimes = [0; 6];
        let mut tree = self.unfurl(&mut times)?;
        let root = tree.rank() == 0;

        // Tree children were all forked under direct waits above; from
        // here on, exactly one thread owns waitpid.
        let reaper = Reaper::start(self.groups.pid_index());

        self.gather_spawn_pids(&mut tree)?;
        let epmap = self.exchange_endpoints(&mut tree)?;
        self.probe_costs(&mut tree, &epmap)?;

        // Application phase: root holds the validated parameters,
        // everyone gets them, every spawn starts its local procs.
        let mut appmap = self.app_template.clone().unwrap_or_default();
        if root {
            println!("Application parameters map:");
            print!("{appmap}");
            println!();
        }
        {
            let _p = Phase::begin(root, "broadcast app params");
            tree.bcast_map(&mut appmap)?;
            tree.signal_to_root()?;
        }
        self.start_group(&mut tree, &appmap)?;

        // Fold the unfurl costs into the slowest root-to-leaf path.
        tree.reduce_critical_path(&times, &UNFURL_LABELS)?;

        // A relayed launcher copy is no longer needed once the tree is up.
        if self.params.get("COPY") == Some("1") {
            if let Some(exe) = self.params.get("EXE") {
                let _ = std::fs::remove_file(exe);
            }
        }

        // Terminal wait: every child this process forked — tree
        // children and app procs alike — must be reaped.
        {
            let _p = Phase::begin(root, "wait for completion");
            tree.signal_from_root()?;
            let expected = tree.child_count() + self.groups.total_pids();
            reaper.wait_for(expected);
            for event in reaper.drain_events() {
                tracing::debug!(pid = event.pid, status = event.status, "reaped");
            }
        }

        tree.teardown();
        reaper.stop();
        Ok(())
    }

    // ── Unfurl ───────────────────────────────────────────────────────

    /// Connect to the parent, build the topology, and launch, accept,
    /// and parameterize every child. Returns the connected tree.
    fn unfurl(&mut self, times: &mut UnfurlTimes) -> Result<SpawnTree> {
        let root = self.parent_addr.is_none();
        let _whole = Phase::begin(root, "unfurl tree");

        // Phase 1: rendezvous with the parent and learn the parameters.
        let parent_channel = match self.parent_addr.clone() {
            Some(addr) => {
                let _p = Phase::begin(root, "connect back to parent");
                let start = Instant::now();
                let mut ch = Channel::connect(&addr)?;
                times[0] = elapsed_ns(start);

                let start = Instant::now();
                let id = self.spawn_id.clone().ok_or_else(|| {
                    SpawnError::config(format!("{ENV_ID} must be set when {ENV_PARENT} is"))
                })?;
                let mut idmap = StrMap::new();
                idmap.set("ID", id);
                idmap.set("PID", nix::unistd::getpid().to_string());
                wire::write_map(&mut ch, &idmap)?;
                self.params = wire::read_map(&mut ch)?;
                times[1] = elapsed_ns(start);
                Some(ch)
            }
            None => None,
        };

        // Phase 2: topology from the received (or built) parameters.
        let rank = self.rank()?;
        let ranks: usize = self.params.require_int("N")?;
        let degree: usize = self.params.require_int("DEG")?;
        let mut tree = SpawnTree::new(rank, ranks, degree)?;
        if let Some(ch) = parent_channel {
            tree.set_parent_channel(ch);
        }
        tracing::debug!(rank, ranks, degree, children = tree.child_count(), "topology");

        let spawn_exe = self.params.require("EXE")?.to_string();

        // Phase 3: relay the launcher binary to the children's hosts.
        let start = Instant::now();
        if self.params.get("COPY") == Some("1") && tree.child_count() > 0 {
            let _p = Phase::begin(root, "copy launcher exe");
            let mut pids = Vec::with_capacity(tree.child_count());
            for i in 0..tree.child_count() {
                let host = self.child_host(&tree, i)?;
                pids.push(launch::copy_exe(&self.params, &host, &spawn_exe)?);
            }
            for pid in pids {
                nix::sys::wait::waitpid(pid, None)
                    .map_err(|e| SpawnError::launch(format!("waitpid for copy failed: {e}")))?;
            }
        }
        times[2] = elapsed_ns(start);

        // Phase 4: fork one launcher per child host.
        let start = Instant::now();
        let mut global_to_local: FxHashMap<usize, usize> = FxHashMap::default();
        {
            let _p = Phase::begin(root, "launch children");
            let cwd = std::env::current_dir()
                .map_err(|e| SpawnError::io(format!("getcwd failed: {e}")))?
                .to_string_lossy()
                .into_owned();
            for i in 0..tree.child_count() {
                let child_rank = tree.child_rank(i);
                global_to_local.insert(child_rank, i);
                let host = self.child_host(&tree, i)?;

                let mut args = StrMap::new();
                args.set("ARG0", spawn_exe.as_str());
                args.set("ARGS", "1");
                let mut envs = StrMap::new();
                envs.set("ENV0", format!("{ENV_PARENT}={}", self.endpoint.name()));
                envs.set("ENV1", format!("{ENV_ID}={child_rank}"));
                envs.set("ENVS", "2");

                let pid =
                    launch::fork_proc(Some(&host), &self.params, &cwd, &spawn_exe, &args, &envs)?;
                tree.set_child_launch(i, host, pid.as_raw());
            }
        }
        times[3] = elapsed_ns(start);

        // Phase 5: accept every child's rendezvous connection.
        let start = Instant::now();
        let mut pending = Vec::with_capacity(tree.child_count());
        {
            let _p = Phase::begin(root, "accept children");
            for _ in 0..tree.child_count() {
                pending.push(self.endpoint.accept()?);
            }
        }
        times[4] = elapsed_ns(start);

        // Phase 6: identify each child and hand it the parameters.
        let start = Instant::now();
        {
            let _p = Phase::begin(root, "send params to children");
            for mut ch in pending {
                let idmap = wire::read_map(&mut ch)?;
                let child_id: usize = idmap.require_int("ID")?;
                let child_pid: i64 = idmap.require_int("PID")?;
                let index = *global_to_local.get(&child_id).ok_or_else(|| {
                    SpawnError::protocol(format!("unexpected child id {child_id}"))
                })?;
                tracing::debug!(child_id, child_pid, "child connected");
                wire::write_map(&mut ch, &self.params)?;
                tree.set_child_channel(index, ch);
            }
        }
        times[5] = elapsed_ns(start);

        // Tell the root the whole tree is up.
        tree.signal_to_root()?;
        Ok(tree)
    }

    /// Hostname a child rank runs on, from the per-host parameter keys.
    fn child_host(&self, tree: &SpawnTree, index: usize) -> Result<String> {
        let child_rank = tree.child_rank(index);
        self.params
            .get(&child_rank.to_string())
            .map(str::to_string)
            .ok_or_else(|| SpawnError::config(format!("no host listed for rank {child_rank}")))
    }

    // ── Post-unfurl measurements ─────────────────────────────────────

    /// Gather every spawn's pid to the root; feed the MPIR table when
    /// the tree itself is the debug target.
    fn gather_spawn_pids(&mut self, tree: &mut SpawnTree) -> Result<()> {
        let rank = tree.rank();
        let root = rank == 0;

        let mut pidmap = StrMap::new();
        {
            let _p = Phase::begin(root, "gather spawn pids");
            tree.signal_from_root()?;
            pidmap.set(rank.to_string(), nix::unistd::getpid().to_string());
            tree.gather_map(&mut pidmap)?;
            tree.signal_to_root()?;
        }

        if root {
            println!("Spawn pid map:");
            print!("{pidmap}");
            println!();
        }

        if self.params.get("MPIR") == Some(KEY_MPIR_SPAWN) {
            if root {
                let exe = self.params.require("EXE")?;
                let mut entries = Vec::with_capacity(tree.ranks());
                for i in 0..tree.ranks() {
                    let host = self.params.require(&i.to_string())?;
                    let pid: i32 = pidmap.require_int(&i.to_string())?;
                    entries.push((host.to_string(), exe.to_string(), pid));
                }
                mpir::publish_proctable(&entries);
            }
            // Hold everyone until the debugger has attached at the root.
            tree.signal_from_root()?;
        }
        Ok(())
    }

    /// Allgather every spawn's endpoint name; the root prints the map.
    fn exchange_endpoints(&mut self, tree: &mut SpawnTree) -> Result<StrMap> {
        let root = tree.rank() == 0;
        let mut epmap = StrMap::new();
        {
            let _p = Phase::begin(root, "spawn endpoint exchange");
            tree.signal_from_root()?;
            epmap.set(tree.rank().to_string(), self.endpoint.name());
            tree.allgather_map(&mut epmap)?;
            tree.signal_to_root()?;
        }
        if root {
            println!("Spawn endpoints map:");
            print!("{epmap}");
            println!();
        }
        Ok(epmap)
    }

    /// Timing probes: map pack/unpack on the root, signal waves on the
    /// whole tree. Pure measurement, no state changes.
    fn probe_costs(&mut self, tree: &mut SpawnTree, epmap: &StrMap) -> Result<()> {
        let root = tree.rank() == 0;

        if root {
            let _p = Phase::begin(true, "pack/unpack strmap x1000");
            for _ in 0..1000 {
                let buf = epmap.pack();
                StrMap::unpack(&buf)?;
            }
        }

        tree.signal_from_root()?;
        {
            let _p = Phase::begin(root, "signal costs x1000");
            for _ in 0..1000 {
                tree.signal_to_root()?;
                tree.signal_from_root()?;
            }
        }
        Ok(())
    }

    // ── Application launch ───────────────────────────────────────────

    /// Start a process group: fork the local app procs and run the
    /// rendezvous exchanges the parameters ask for.
    pub fn start_group(&mut self, tree: &mut SpawnTree, params: &StrMap) -> Result<GroupId> {
        let rank = tree.rank();
        let root = rank == 0;

        let name = params.require("NAME")?.to_string();
        let group_id = self.groups.insert(&name, params.clone());

        let app_exe = params.require("EXE")?.to_string();
        let app_dir = params.require("CWD")?.to_string();
        let num_procs: usize = params.require_int("PPN")?;
        let use_pmi = params.get("PMI") == Some("1");
        let use_ring = params.get("RING") == Some("1");
        let use_fifo = params.get("FIFO") == Some("1");
        let use_bin_bcast = params.get("BIN_BCAST") == Some("1");
        let mpir_app = self.params.get("MPIR") == Some(KEY_MPIR_APP);

        // The app procs rendezvous on our main endpoint, or on a
        // dedicated FIFO endpoint when asked for one.
        let fifo_ep;
        {
            let _p = Phase::begin(root, "open init endpoint");
            tree.signal_from_root()?;
            fifo_ep = if (use_pmi || use_ring) && use_fifo {
                Some(Endpoint::open(Transport::Fifo)?)
            } else {
                None
            };
            tree.signal_to_root()?;
        }
        let ep: &Endpoint = match &fifo_ep {
            Some(ep) => ep,
            None => &self.endpoint,
        };
        let ep_name = ep.name().to_string();

        // Optionally relay the app binary over the tree and run the
        // staged copy instead of the original path.
        let exe = if use_bin_bcast {
            let _p = Phase::begin(root, "bcast app binary");
            tree.signal_from_root()?;
            let staged = tree.bcast_file(&app_exe)?;
            tree.signal_to_root()?;
            staged.to_string_lossy().into_owned()
        } else {
            app_exe
        };

        // Fork the local app procs.
        {
            let _p = Phase::begin(root, "launch app procs");
            tree.signal_from_root()?;
            for _ in 0..num_procs {
                let mut args = StrMap::new();
                args.set("ARG0", exe.as_str());
                args.set("ARGS", "1");

                let mut envs = StrMap::new();
                envs.set("ENV0", format!("MV2_PMI_ADDR={ep_name}"));
                if mpir_app {
                    envs.set("ENV1", "MV2_MPIR=1");
                    envs.set("ENVS", "2");
                } else {
                    envs.set("ENVS", "1");
                }

                let pid = launch::fork_proc(None, &self.params, &app_dir, &exe, &args, &envs)?;
                self.groups.record_pid(group_id, pid.as_raw());
            }
            tree.signal_to_root()?;
        }

        // When the app is the debug target, collect (host, exe, pid)
        // per app rank at the root and publish the MPIR table.
        if mpir_app {
            let mut procmap = StrMap::new();
            {
                let _p = Phase::begin(root, "gather app proc info");
                tree.signal_from_root()?;
                let hostname = tcp::local_hostname()?;
                for (i, pid) in self.groups.group(group_id).pids.iter().enumerate() {
                    let app_rank = rank * num_procs + i;
                    procmap.set(format!("H{app_rank}"), hostname.as_str());
                    procmap.set(format!("P{app_rank}"), pid.to_string());
                    procmap.set(format!("E{app_rank}"), exe.as_str());
                }
                tree.gather_map(&mut procmap)?;
                if root {
                    println!("App proc host, pid, exe map:");
                    print!("{procmap}");
                    println!();
                }
                tree.signal_to_root()?;
            }

            if root {
                let total = tree.ranks() * num_procs;
                let mut entries = Vec::with_capacity(total);
                for i in 0..total {
                    let host = procmap.require(&format!("H{i}"))?;
                    let pid: i32 = procmap.require_int(&format!("P{i}"))?;
                    let exe = procmap.require(&format!("E{i}"))?;
                    entries.push((host.to_string(), exe.to_string(), pid));
                }
                mpir::publish_proctable(&entries);
            }
            tree.signal_from_root()?;
        }

        // The rendezvous exchanges the app expects.
        if use_pmi {
            let jobid = params.get("JOBID").unwrap_or("0").to_string();
            pmi::pmi_exchange(tree, ep, num_procs, &jobid)?;
        }
        if use_ring {
            ring::ring_exchange(tree, ep, num_procs)?;
        }

        // Tear down a dedicated FIFO endpoint once the exchanges are done.
        {
            let _p = Phase::begin(root, "close init endpoint");
            tree.signal_from_root()?;
            drop(fifo_ep);
            tree.signal_to_root()?;
        }

        Ok(group_id)
    }
}
