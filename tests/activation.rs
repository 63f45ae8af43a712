mod common;

use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::PathBuf,
    sync::Arc,
    thread,
};

use anyhow::Result;
use common::{RecordingRunner, home, open};
use sarge::{
    Sarge, SargeError,
    deployment::{APPCFG_FILE, cfg_folder_of, run_folder_of},
};
use sarge_plugin::{AppConfig, Event, PluginError, Signal};

const BLOG: &str = "name: blog\ncommand: ./serve\nrequire-services:\n  - { type: persistent-folder, name: uploads }\n";
const SHOP: &str = "name: shop\ncommand: ./shop\n";

#[test]
fn pointer_moves_only_after_artifacts_are_written() -> Result<()> {
    let dir = home("plugins: [services, folders]\n", &[("blog", BLOG)]);
    let runner = Arc::new(RecordingRunner::default());
    let mut sarge = open(&dir, &runner);

    let link = sarge.layout().active_link("blog");
    let observed = Arc::new(std::sync::Mutex::new(None));
    let seen = observed.clone();
    let link_for_plugin = link.clone();
    sarge.load_plugin("observer", move |_host, registrar| {
        registrar.on_fn(Signal::ActivateVersion, move |_event: &mut Event<'_>| {
            *seen.lock().unwrap() = Some(fs::read_link(&link_for_plugin).ok());
            Ok(())
        });
        Ok(())
    })?;

    let version = sarge.new_version("blog")?;
    let run = sarge.activate_version("blog", &version)?;

    // During the pipeline there was no pointer yet.
    assert_eq!(*observed.lock().unwrap(), Some(None));
    assert_eq!(fs::read_link(&link)?, run);
    let version = version.canonicalize()?;
    assert!(cfg_folder_of(&version).join(APPCFG_FILE).is_file());

    let calls = runner.calls();
    let reread = calls.iter().position(|c| c.ends_with("reread")).unwrap();
    let restart = calls.iter().position(|c| c.ends_with("restart blog:*")).unwrap();
    assert!(reread < restart);
    Ok(())
}

#[test]
fn app_config_holds_every_plugin_contribution() -> Result<()> {
    let dir = home("plugins: [services, folders]\n", &[("blog", BLOG)]);
    let runner = Arc::new(RecordingRunner::default());
    let mut sarge = open(&dir, &runner);
    sarge.load_plugin("mail", |_host, registrar| {
        registrar.on_fn(Signal::ActivateVersion, |event: &mut Event<'_>| {
            if let Event::ActivateVersion { context, .. } = event {
                context.set_service("smtp", "localhost:25");
            }
            Ok(())
        });
        Ok(())
    })?;

    let version = sarge.new_version("blog")?;
    fs::write(
        version.join("sargeapp.yaml"),
        "services:\n  cache: { host: localhost, port: 6379 }\n",
    )?;
    sarge.activate_version("blog", &version)?;

    let appcfg = AppConfig::read(&cfg_folder_of(&version.canonicalize()?).join(APPCFG_FILE))?;
    let keys: BTreeSet<&str> = appcfg.services.keys().map(String::as_str).collect();
    assert_eq!(keys, BTreeSet::from(["cache", "smtp", "uploads"]));
    let uploads = sarge.layout().data_dir().join("blog").join("uploads");
    assert_eq!(appcfg.services["uploads"], uploads.display().to_string());
    assert!(uploads.is_dir());
    Ok(())
}

#[test]
fn reactivation_switches_pointer_and_keeps_old_run_folder() -> Result<()> {
    let dir = home("plugins: []\n", &[("blog", BLOG)]);
    let runner = Arc::new(RecordingRunner::default());
    let sarge = open(&dir, &runner);

    let v1 = sarge.new_version("blog")?;
    let run1 = sarge.activate_version("blog", &v1)?;
    let v2 = sarge.new_version("blog")?;
    let run2 = sarge.activate_version("blog", &v2)?;

    assert_ne!(run1, run2);
    assert_eq!(fs::read_link(sarge.layout().active_link("blog"))?, run2);
    assert!(run1.is_dir());
    assert!(run_folder_of(&v1.canonicalize()?).is_dir());
    Ok(())
}

#[test]
fn failing_setup_step_leaves_previous_pointer_alone() -> Result<()> {
    let dir = home("plugins: []\n", &[("blog", BLOG)]);
    let runner = Arc::new(RecordingRunner::default());
    let mut sarge = open(&dir, &runner);

    let v1 = sarge.new_version("blog")?;
    let run1 = sarge.activate_version("blog", &v1)?;

    sarge.load_plugin("virtualenv", |host, registrar| {
        let runner = host.runner.clone();
        registrar.on_fn(Signal::ActivateVersion, move |event: &mut Event<'_>| {
            let Event::ActivateVersion { target, .. } = event else {
                return Ok(());
            };
            let argv = vec![
                "virtualenv".to_string(),
                target.run_folder.join("venv").display().to_string(),
            ];
            runner.check(&argv, None)?;
            Ok::<(), PluginError>(())
        });
        Ok(())
    })?;
    runner.fail_when("virtualenv");

    let v2 = sarge.new_version("blog")?;
    let err = sarge.activate_version("blog", &v2).unwrap_err();
    match &err {
        SargeError::Deploy { name, version, .. } => {
            assert_eq!(name, "blog");
            assert_eq!(version.as_deref(), Some(v2.canonicalize()?.as_path()));
        }
        other => panic!("expected a deploy error, got {other:?}"),
    }
    assert!(err.to_string().contains("blog"));

    assert_eq!(fs::read_link(sarge.layout().active_link("blog"))?, run1);
    let v2 = v2.canonicalize()?;
    assert!(!run_folder_of(&v2).exists());
    assert!(!cfg_folder_of(&v2).exists());
    // The failed version may be activated again once the problem is fixed.
    assert!(v2.is_dir());
    Ok(())
}

#[test]
fn static_route_aliases_into_version_folder() -> Result<()> {
    let dir = home("plugins: [vhost]\nnginx_reload: [nginx, -s, reload]\n", &[("blog", BLOG)]);
    let runner = Arc::new(RecordingRunner::default());
    let sarge = open(&dir, &runner);

    let version = sarge.new_version("blog")?;
    fs::write(
        version.join("sargeapp.yaml"),
        "urlmap:\n  - { url: /media, type: static, path: mymedia }\n",
    )?;
    let run = sarge.activate_version("blog", &version)?;

    let site = fs::read_to_string(run.join("nginx-site.conf"))?;
    let version: PathBuf = version.canonicalize()?;
    assert_eq!(site.matches("location ").count(), 1);
    assert!(site.contains("location /media {"));
    assert!(site.contains(&format!("alias {};", version.join("mymedia").display())));

    // Reachable through the active pointer, and nginx was told about it.
    assert!(sarge.layout().active_link("blog").join("nginx-site.conf").is_file());
    assert!(runner.calls().iter().any(|c| c == "nginx -s reload"));
    Ok(())
}

#[test]
fn unknown_deployment_is_not_found() {
    let dir = home("plugins: []\n", &[]);
    let runner = Arc::new(RecordingRunner::default());
    let sarge = open(&dir, &runner);
    assert!(matches!(
        sarge.new_version("ghost"),
        Err(SargeError::NotFound { kind: "deployment", .. })
    ));
}

#[test]
fn version_of_another_deployment_is_refused() -> Result<()> {
    let dir = home("plugins: []\n", &[("blog", BLOG), ("shop", SHOP)]);
    let runner = Arc::new(RecordingRunner::default());
    let sarge = open(&dir, &runner);

    let shop_version = sarge.new_version("shop")?;
    sarge.new_version("blog")?;
    match sarge.activate_version("blog", &shop_version) {
        Err(SargeError::Deploy { name, source, .. }) => {
            assert_eq!(name, "blog");
            assert!(matches!(*source, SargeError::NotFound { kind: "version", .. }));
        }
        other => panic!("expected a deploy error, got {other:?}"),
    }
    assert!(fs::symlink_metadata(sarge.layout().active_link("blog")).is_err());
    let shop_version = shop_version.canonicalize()?;
    assert!(!run_folder_of(&shop_version).exists());
    assert!(!cfg_folder_of(&shop_version).exists());
    assert!(runner.calls().is_empty());

    // The owner can still activate it.
    sarge.activate_version("shop", &shop_version)?;
    Ok(())
}

#[test]
fn concurrent_new_version_never_collides() -> Result<()> {
    let dir = home("plugins: []\n", &[("blog", BLOG)]);
    let root = dir.path().to_path_buf();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let root = root.clone();
            thread::spawn(move || {
                let sarge = Sarge::with_runner(&root, Arc::new(RecordingRunner::default())).unwrap();
                (0..5)
                    .map(|_| sarge.new_version("blog").unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut versions = HashSet::new();
    for handle in handles {
        for version in handle.join().unwrap() {
            assert!(versions.insert(version.clone()), "duplicate version {}", version.display());
        }
    }
    assert_eq!(versions.len(), 40);
    let sarge = Sarge::with_runner(&root, Arc::new(RecordingRunner::default()))?;
    let numbers: Vec<u64> = sarge.deployment("blog")?.versions()?.into_iter().map(|(n, _)| n).collect();
    assert_eq!(numbers, (1..=40).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn destroy_deployment_survives_failing_plugin() -> Result<()> {
    let dir = home("plugins: []\n", &[("blog", BLOG)]);
    let runner = Arc::new(RecordingRunner::default());
    let mut sarge = open(&dir, &runner);
    let version = sarge.new_version("blog")?;
    sarge.activate_version("blog", &version)?;

    sarge.load_plugin("dns", |_host, registrar| {
        registrar.on_fn(Signal::WillDestroy, |_event: &mut Event<'_>| {
            Err(PluginError::Other("zone update refused".into()))
        });
        Ok(())
    })?;

    sarge.destroy_deployment("blog")?;
    assert!(!sarge.deployment("blog")?.folder().exists());
    assert!(fs::symlink_metadata(sarge.layout().active_link("blog")).is_err());
    assert!(!sarge.supervisor().fragment_path("blog").exists());
    Ok(())
}
