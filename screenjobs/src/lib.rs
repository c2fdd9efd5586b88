//! Sandboxed runs of user screen programs.
//!
//! Each job gets its own environment, source storage and run directory.
//! The supervisor stages a job's files, spawns its interpreter, enforces the
//! job's maximum runtime, and lets at most one run drive the shared screen,
//! relaying the frames that run sends to the screen.

mod actors;
pub mod archive;
pub mod config;
mod context;
pub mod error;
pub mod job;
pub mod ledger;
pub mod programs;
pub mod provision;
pub mod registry;
pub mod screen;
pub mod stage;
pub mod store;
pub mod types;

// re-export the supervisor handle as if it is the supervisor itself.
pub use actors::relay::{RelayHandle, RelayStats};
pub use actors::supervisor::SupervisorHandle as Supervisor;
pub use actors::supervisor::{ExitCallback, ResetSummary, RunHandle, RunOutcome, RunRefused};
pub use config::Config;
pub use context::Context;
pub use error::{Error, Result};
pub use job::{Job, JobStatus};
pub use registry::{JobRef, JobSpec};
pub use types::{ExitReason, JobId, OwnerRef, RunId, RunPrivilege};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NewRun;
    use crate::programs::{OptionValue, ProgramError};
    use crate::provision::SymlinkProvisioner;
    use crate::screen::SimulatedScreen;
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::io::Read;
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::oneshot;
    use wire::client::ScreenClient;
    use wire::Color;

    struct Host {
        _root: TempDir,
        screen: Arc<SimulatedScreen>,
        supervisor: Supervisor,
    }

    impl Host {
        fn ctx(&self) -> &Arc<Context> {
            self.supervisor.context()
        }

        async fn job(&self, privilege: RunPrivilege, max_runtime: Option<u64>, code: &str) -> Job {
            self.ctx()
                .registry
                .create(JobSpec {
                    owner: Some(OwnerRef("tester".into())),
                    run_privilege: privilege,
                    max_runtime_secs: max_runtime,
                    code: Some(code.to_string()),
                })
                .await
                .expect("create job")
        }

        fn status(&self, job: &Job) -> JobStatus {
            self.ctx().registry.resolve(job).expect("job").status
        }
    }

    fn host() -> Host {
        let root = TempDir::new().expect("tempdir");
        let mut config = Config::rooted_at(root.path());
        for dir in [
            &config.sandbox.envs_dir,
            &config.sandbox.storage_dir,
            &config.sandbox.run_dir,
        ] {
            std::fs::create_dir_all(dir).expect("sandbox root");
        }
        config.sandbox.entrypoint = "main.sh".into();
        config.ipc.poll_interval_ms = 20;
        let screen = Arc::new(SimulatedScreen::new(
            config.screen.width,
            config.screen.height,
        ));
        let ctx = Context::new(
            config,
            screen.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SymlinkProvisioner::new("/bin/sh")),
        );
        Host {
            _root: root,
            screen,
            supervisor: Supervisor::spawn(ctx, 16),
        }
    }

    #[tokio::test]
    async fn natural_exit_is_recorded_and_reported() {
        let host = host();
        let job = host
            .job(
                RunPrivilege::Simulate,
                None,
                "echo out\necho err >&2\nexit 3\n",
            )
            .await;
        let (tx, rx) = oneshot::channel();
        let on_exit: ExitCallback = Box::new(move |run, code, stdout, stderr| {
            let _ = tx.send((run, code, stdout, stderr));
        });

        let run = host.supervisor.run(&job, Some(on_exit)).await.expect("run");
        let run_id = run.run_id;
        let outcome = run.wait().await.expect("outcome");

        assert_eq!(outcome.exit_reason, ExitReason::Natural);
        assert_eq!(outcome.return_code, Some(3));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert_eq!(
            rx.await.expect("callback"),
            (run_id, Some(3), "out\n".to_string(), "err\n".to_string())
        );

        let entry = host.ctx().ledger.get(&run_id).expect("entry");
        assert!(!entry.is_open());
        assert_eq!(entry.exit_reason, Some(ExitReason::Natural));
        assert_eq!(entry.return_code, Some(3));
        assert_eq!(entry.job, Some(job.id));
        assert_eq!(entry.owner, Some(OwnerRef("tester".into())));
        assert_eq!(host.status(&job), JobStatus::Idle);
    }

    #[tokio::test]
    async fn simulated_runs_get_the_simulation_flags_and_a_sandbox() {
        let host = host();
        let job = host
            .job(
                RunPrivilege::Simulate,
                None,
                "echo \"$@\"\npwd\necho \"$HOME\"\necho \"$VIRTUAL_ENV\"\n",
            )
            .await;
        let run = host.supervisor.run(job.id, None).await.expect("run");
        assert!(run.relay_addr.is_none());
        let outcome = run.wait().await.expect("outcome");

        let lines: Vec<_> = outcome.stdout.lines().collect();
        assert_eq!(
            lines[0],
            "--screen-width 32 --screen-height 8 --simulate"
        );
        assert_eq!(lines[1], job.run_dir.to_str().unwrap());
        assert_eq!(lines[2], job.run_dir.to_str().unwrap());
        assert_eq!(lines[3], job.env_path.to_str().unwrap());
        assert!(job.run_path().is_file());
    }

    #[tokio::test]
    async fn second_hardware_run_is_refused_while_the_first_is_open() {
        let host = host();
        let a = host.job(RunPrivilege::Hardware, None, "sleep 10\n").await;
        let b = host.job(RunPrivilege::Hardware, None, "exit 0\n").await;

        let run_a = host.supervisor.run(&a, None).await.expect("run a");
        assert_eq!(host.status(&a), JobStatus::Running);

        let refused = host.supervisor.run(&b, None).await.expect_err("b refused");
        assert!(matches!(refused.reason, Error::Conflict(_)));
        assert_eq!(host.ctx().ledger.open_entries().len(), 1);
        assert!(host.ctx().ledger.get(&refused.run_id).is_none());
        assert_eq!(host.status(&b), JobStatus::Idle);

        // a simulated run is never blocked by the screen
        let sim = host.job(RunPrivilege::Simulate, None, "exit 0\n").await;
        host.supervisor
            .run(&sim, None)
            .await
            .expect("simulated run")
            .wait()
            .await
            .expect("outcome");

        let entry = host.supervisor.stop(run_a.run_id, true).await.expect("stop");
        assert_eq!(entry.exit_reason, Some(ExitReason::Admin));
        assert!(!entry.is_open());
        let outcome = run_a.wait().await.expect("outcome a");
        assert_eq!(outcome.exit_reason, ExitReason::Admin);
        assert_eq!(host.status(&a), JobStatus::Idle);

        let run_b = host.supervisor.run(&b, None).await.expect("run b");
        let outcome = run_b.wait().await.expect("outcome b");
        assert_eq!(outcome.return_code, Some(0));
        assert_eq!(host.status(&b), JobStatus::Idle);
    }

    #[tokio::test]
    async fn overrunning_jobs_are_killed_on_time() {
        let host = host();
        let job = host.job(RunPrivilege::Hardware, Some(2), "sleep 10\n").await;

        let run = host.supervisor.run(&job, None).await.expect("run");
        let run_id = run.run_id;
        let outcome = run.wait().await.expect("outcome");

        assert_eq!(outcome.exit_reason, ExitReason::Timeout);
        assert!(outcome.elapsed >= Duration::from_secs(2));
        assert!(outcome.elapsed < Duration::from_secs(5), "{:?}", outcome.elapsed);
        let entry = host.ctx().ledger.get(&run_id).expect("entry");
        assert_eq!(entry.exit_reason, Some(ExitReason::Timeout));
        assert!(!entry.is_open());
        assert_eq!(host.status(&job), JobStatus::Idle);

        let next = host.job(RunPrivilege::Hardware, None, "exit 0\n").await;
        host.supervisor.run(&next, None).await.expect("screen free again");
    }

    #[tokio::test]
    async fn hardware_runs_drive_the_screen_through_their_relay() {
        let host = host();
        host.ctx()
            .programs
            .start("solid", HashMap::new())
            .await
            .expect("program");
        let job = host
            .job(RunPrivilege::Hardware, None, "echo \"$@\"\nsleep 10\n")
            .await;

        let run = host.supervisor.run(&job, None).await.expect("run");
        assert_eq!(host.ctx().programs.active(), None);
        let addr = run.relay_addr.expect("relay");
        let mut client = ScreenClient::connect("127.0.0.1", addr.port(), 32, 8)
            .await
            .expect("client");

        let red = Color::new(0xFF0000);
        let renders = host.screen.render_count();
        client.fill(red).await.expect("fill");
        client.render().await.expect("render");
        for _ in 0..100 {
            if host.screen.render_count() > renders {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(host.screen.shown().iter().all(|c| *c == red));

        host.supervisor.stop(run.run_id, false).await.expect("stop");
        let outcome = run.wait().await.expect("outcome");
        assert_eq!(outcome.exit_reason, ExitReason::System);
        assert_eq!(
            outcome.stdout.trim_end(),
            format!(
                "--screen-width 32 --screen-height 8 --screen-host 127.0.0.1 --tx-port {}",
                addr.port()
            )
        );
        // the relay is gone with the run
        tokio::net::TcpListener::bind(addr).await.expect("port released");
    }

    #[tokio::test]
    async fn runs_with_missing_paths_never_start() {
        let host = host();
        let job = host.job(RunPrivilege::Hardware, None, "exit 0\n").await;
        std::fs::remove_file(&job.interpreter_path).expect("unlink interpreter");

        let refused = host.supervisor.run(&job, None).await.expect_err("refused");
        assert!(matches!(refused.reason, Error::Precondition(_)));
        assert!(host.ctx().ledger.entries().is_empty());
        assert_eq!(host.status(&job), JobStatus::Idle);
    }

    #[tokio::test]
    async fn busy_jobs_refuse_runs_and_code_changes() {
        let host = host();
        let job = host.job(RunPrivilege::Simulate, None, "sleep 10\n").await;
        let run = host.supervisor.run(&job, None).await.expect("run");

        let again = host.supervisor.run(&job, None).await.expect_err("busy");
        assert!(matches!(again.reason, Error::Conflict(_)));
        let save = host.ctx().registry.save_code(&job, "exit 0\n").await;
        assert!(matches!(save, Err(Error::Conflict(_))));
        assert_eq!(host.status(&job), JobStatus::Running);

        host.supervisor.stop(run.run_id, false).await.expect("stop");
        run.wait().await.expect("outcome");
        host.ctx()
            .registry
            .save_code(&job, "exit 0\n")
            .await
            .expect("idle again");
    }

    #[tokio::test]
    async fn stopping_closed_or_unknown_runs_is_not_found() {
        let host = host();
        let job = host.job(RunPrivilege::Simulate, None, "exit 0\n").await;
        let run = host.supervisor.run(&job, None).await.expect("run");
        let run_id = run.run_id;
        run.wait().await.expect("outcome");

        assert!(matches!(
            host.supervisor.stop(run_id, false).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            host.supervisor.stop(RunId::new(), true).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn open_runs_without_a_worker_are_killed_by_pid() {
        let host = host();
        let job = host.job(RunPrivilege::Simulate, None, "exit 0\n").await;
        let mut orphan = std::process::Command::new("sleep")
            .arg("10")
            .process_group(0)
            .spawn()
            .expect("spawn sleep");
        let entry = host
            .ctx()
            .ledger
            .create(NewRun {
                id: None,
                pid: orphan.id(),
                interpreter_path: &job.interpreter_path,
                run_path: &job.entry_path(),
                privilege: RunPrivilege::Simulate,
                job: None,
                owner: None,
            })
            .expect("entry");

        let stopped = host.supervisor.stop(entry.id, true).await.expect("stop");
        assert_eq!(stopped.exit_reason, Some(ExitReason::Admin));
        let status = orphan.wait().expect("wait");
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn reset_stops_runs_and_forgets_everything() {
        let host = host();
        let busy = host.job(RunPrivilege::Hardware, None, "sleep 10\n").await;
        let idle = host.job(RunPrivilege::Simulate, None, "exit 0\n").await;
        host.ctx()
            .programs
            .start("chase", HashMap::from([("step".to_string(), OptionValue::Integer(2))]))
            .await
            .expect("program");
        let run = host.supervisor.run(&busy, None).await.expect("run");
        assert_eq!(host.ctx().programs.active(), None);
        assert_eq!(host.ctx().programs.paused(), Some("chase"));
        assert!(matches!(
            host.ctx().programs.start("solid", HashMap::new()).await,
            Err(ProgramError::ScreenBusy { run: holder }) if holder == run.run_id
        ));

        let summary = host.supervisor.reset(None).await.expect("reset");
        assert_eq!(
            summary,
            ResetSummary {
                stopped_runs: 1,
                archived_jobs: 0,
                removed_jobs: 2,
                cleared_runs: 1,
            }
        );
        assert_eq!(run.wait().await.expect("outcome").exit_reason, ExitReason::System);
        assert!(host.ctx().registry.jobs().is_empty());
        assert!(host.ctx().ledger.entries().is_empty());
        assert_eq!(host.ctx().programs.active(), None);
        assert_eq!(host.ctx().programs.paused(), None);
        for job in [&busy, &idle] {
            assert!(!job.env_path.exists());
            assert!(!job.storage_path.exists());
        }
    }

    #[tokio::test]
    async fn reset_can_archive_storage_before_purging() {
        let host = host();
        let archive_dir = host._root.path().join("archive");
        let kept = host.job(RunPrivilege::Simulate, None, "echo keep me\n").await;
        let emptied = host.job(RunPrivilege::Simulate, None, "").await;
        std::fs::remove_file(emptied.entry_path()).expect("empty storage");

        let summary = host
            .supervisor
            .reset(Some(archive_dir.as_path()))
            .await
            .expect("reset");
        assert_eq!(summary.archived_jobs, 1);
        assert_eq!(summary.removed_jobs, 2);
        assert!(!kept.storage_path.exists());

        let archives: Vec<_> = std::fs::read_dir(&archive_dir)
            .expect("archive dir")
            .map(|entry| entry.expect("entry").path())
            .collect();
        assert_eq!(archives.len(), 1);
        let name = archives[0].file_name().expect("name").to_string_lossy().into_owned();
        assert!(name.ends_with(&format!("-W{}.zip", kept.short_id())));

        let mut zip = zip::ZipArchive::new(std::fs::File::open(&archives[0]).expect("open"))
            .expect("zip");
        let mut code = String::new();
        zip.by_name(&format!("{}/main.sh", kept.id))
            .expect("entry file")
            .read_to_string(&mut code)
            .expect("read");
        assert_eq!(code, "echo keep me\n");
        assert!(zip.by_name(archive::MANIFEST_NAME).is_ok());
    }

    #[tokio::test]
    async fn removing_a_running_job_stops_its_run_first() {
        let host = host();
        let job = host.job(RunPrivilege::Hardware, None, "sleep 30\n").await;
        let run = host.supervisor.run(&job, None).await.expect("run");

        assert!(host.supervisor.remove(&job).await.expect("remove"));
        let outcome = tokio::time::timeout(Duration::from_secs(5), run.wait())
            .await
            .expect("stopped promptly")
            .expect("outcome");
        assert_eq!(outcome.exit_reason, ExitReason::System);
        assert!(host.ctx().ledger.open_entries().is_empty());
        assert!(matches!(
            host.ctx().registry.resolve(&job),
            Err(Error::NotFound { .. })
        ));
        assert!(!job.env_path.exists());
        assert!(!job.storage_path.exists());
        assert!(!job.run_dir.exists());
        assert!(!host.supervisor.remove(&job).await.expect("remove again"));

        // the screen is free for the next hardware run
        let next = host.job(RunPrivilege::Hardware, None, "sleep 10\n").await;
        let run = host.supervisor.run(&next, None).await.expect("screen free");
        host.supervisor.stop(run.run_id, false).await.expect("stop");
        run.wait().await.expect("outcome");
    }

    #[tokio::test]
    async fn staging_failures_leave_no_trace() {
        let host = host();
        let job = host.job(RunPrivilege::Simulate, None, "exit 0\n").await;
        // opening a socket file fails for every user, root included
        let _socket = std::os::unix::net::UnixListener::bind(job.storage_path.join("ipc.sock"))
            .expect("socket");

        let refused = host.supervisor.run(&job, None).await.expect_err("refused");
        assert!(matches!(refused.reason, Error::Io(_)));
        assert!(host.ctx().ledger.entries().is_empty());
        assert_eq!(host.status(&job), JobStatus::Idle);
        assert_eq!(std::fs::read_dir(&job.run_dir).expect("run dir").count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_hardware_runs_admit_exactly_one() {
        let host = host();
        let mut jobs = Vec::new();
        for _ in 0..6 {
            jobs.push(host.job(RunPrivilege::Hardware, None, "sleep 10\n").await);
        }

        let attempts = jobs.iter().map(|job| {
            let supervisor = host.supervisor.clone();
            let job = job.clone();
            async move { supervisor.run(&job, None).await }
        });
        let results = futures::future::join_all(attempts).await;

        let mut started = Vec::new();
        for result in results {
            match result {
                Ok(run) => started.push(run),
                Err(refused) => assert!(matches!(refused.reason, Error::Conflict(_))),
            }
        }
        assert_eq!(started.len(), 1);
        let open = host.ctx().ledger.open_entries();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, started[0].run_id);
        assert_eq!(
            jobs.iter()
                .filter(|job| host.status(job) == JobStatus::Running)
                .count(),
            1
        );

        let run = started.remove(0);
        host.supervisor.stop(run.run_id, false).await.expect("stop");
        run.wait().await.expect("outcome");
    }
}
