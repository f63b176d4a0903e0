//! Review-receive cycles: validation rules and the two-caller race.

use std::sync::Arc;
use std::time::{Duration, Instant};

use convoy_daemon::items::{ItemManager, NewItem};
use convoy_daemon::manager::AgentManager;
use convoy_daemon::review::ReviewReceiveController;
use convoy_daemon::watcher::PlanWatcherConfig;
use convoy_harness::{init_git_repo, install_mock_agent, write_behavior, MockRole, TestBed};
use convoy_ledger::derive_item_status;
use convoy_types::{
    AgentId, EventKind, EventRecord, Item, ItemStatus, LinkMode, RepositoryConfig,
    RepositorySource,
};

struct Stack {
    bed: TestBed,
    agents: Arc<AgentManager>,
    items: Arc<ItemManager>,
    review: Arc<ReviewReceiveController>,
}

fn stack() -> Stack {
    install_mock_agent();
    let bed = TestBed::new();
    let ledger = bed.ledger.clone();
    let agents = AgentManager::new(ledger.clone());
    let items = Arc::new(ItemManager::new(ledger.clone(), Arc::clone(&agents)));
    let review = Arc::new(
        ReviewReceiveController::new(ledger, Arc::clone(&agents), Arc::clone(&items))
            .with_watcher_config(PlanWatcherConfig {
                deadline: Duration::from_secs(3),
                poll_interval: Duration::from_millis(100),
                exit_grace: Duration::from_millis(300),
            }),
    );
    Stack {
        bed,
        agents,
        items,
        review,
    }
}

/// Create an item whose event history derives as `completed`, with one PR.
fn completed_item(s: &Stack) -> Item {
    let source = s.bed.root().join("sources/app");
    init_git_repo(&source, "main");

    let item = s
        .items
        .create_item(NewItem {
            name: "shipped".into(),
            description: String::new(),
            design_doc: None,
            repositories: vec![RepositoryConfig {
                directory_name: "app".into(),
                role: "dev".into(),
                source: RepositorySource::Local {
                    path: source,
                    link_mode: LinkMode::Copy,
                },
            }],
        })
        .unwrap();
    s.items.setup_workspace(&item).unwrap();

    let dev = AgentId::new("agent-dev--app--aaaaaa");
    let ledger = &s.bed.ledger;
    ledger
        .record(&EventRecord::agent(
            &item.id,
            &dev,
            EventKind::AgentStarted {
                role: "dev".into(),
                repo: Some("app".into()),
                pid: 111,
            },
        ))
        .unwrap();
    ledger
        .record(&EventRecord::agent(&item.id, &dev, EventKind::TasksCompleted {}))
        .unwrap();
    ledger
        .record(&EventRecord::agent(
            &item.id,
            &dev,
            EventKind::AgentExited {
                exit_code: Some(0),
                signal: None,
            },
        ))
        .unwrap();
    ledger
        .record(&EventRecord::item(
            &item.id,
            EventKind::PrCreated {
                repo: "app".into(),
                pr_url: "https://example.com/acme/app/pull/12".into(),
                pr_number: 12,
                branch: "convoy/app".into(),
                commit: "abc123".into(),
            },
        ))
        .unwrap();

    // An existing plan for the archive step.
    std::fs::write(
        s.bed.layout.plan_file(&item.id),
        format!("version: \"1.0\"\nitemId: {}\nsummary: old\ntasks: []\n", item.id),
    )
    .unwrap();

    let events = ledger.read_item(&item.id).unwrap();
    assert_eq!(derive_item_status(&events), ItemStatus::Completed);
    item
}

#[test]
fn rejects_items_that_are_not_finished() {
    let s = stack();
    let source = s.bed.root().join("sources/unfinished");
    init_git_repo(&source, "main");

    let item = s
        .items
        .create_item(NewItem {
            name: "in flight".into(),
            description: String::new(),
            design_doc: None,
            repositories: vec![RepositoryConfig {
                directory_name: "app".into(),
                role: "dev".into(),
                source: RepositorySource::Local {
                    path: source,
                    link_mode: LinkMode::Copy,
                },
            }],
        })
        .unwrap();

    let err = s.review.start_review_receive(&item.id, None).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("completed or failed"));
}

#[test]
fn rejects_items_without_a_pull_request() {
    let s = stack();
    let source = s.bed.root().join("sources/nopr");
    init_git_repo(&source, "main");

    let item = s
        .items
        .create_item(NewItem {
            name: "no pr".into(),
            description: String::new(),
            design_doc: None,
            repositories: vec![RepositoryConfig {
                directory_name: "app".into(),
                role: "dev".into(),
                source: RepositorySource::Local {
                    path: source,
                    link_mode: LinkMode::Copy,
                },
            }],
        })
        .unwrap();
    s.items.setup_workspace(&item).unwrap();

    // Completed via a no-changes repository, so there is nothing to review.
    let dev = AgentId::new("agent-dev--app--bbbbbb");
    s.bed
        .ledger
        .record(&EventRecord::agent(
            &item.id,
            &dev,
            EventKind::AgentStarted {
                role: "dev".into(),
                repo: Some("app".into()),
                pid: 1,
            },
        ))
        .unwrap();
    s.bed
        .ledger
        .record(&EventRecord::agent(&item.id, &dev, EventKind::TasksCompleted {}))
        .unwrap();
    s.bed
        .ledger
        .record(&EventRecord::agent(
            &item.id,
            &dev,
            EventKind::AgentExited {
                exit_code: Some(0),
                signal: None,
            },
        ))
        .unwrap();
    s.bed
        .ledger
        .record(&EventRecord::item(
            &item.id,
            EventKind::RepoNoChanges { repo: "app".into() },
        ))
        .unwrap();

    let err = s.review.start_review_receive(&item.id, None).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("no pull request"));
}

#[test]
fn rejects_unknown_repositories() {
    let s = stack();
    let item = completed_item(&s);

    let err = s
        .review
        .start_review_receive(&item.id, Some("mystery"))
        .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn opens_a_cycle_and_archives_the_plan() {
    let s = stack();
    let item = completed_item(&s);

    // The receiver produces a fresh plan and exits.
    let workspace = s.bed.layout.workspace_root(&item.id);
    write_behavior(
        &workspace,
        MockRole::ReviewReceiver,
        &format!(
            "cat > plan.yaml <<'EOF'\nversion: \"1.0\"\nitemId: {}\nsummary: follow-up\ntasks:\n  - id: fix-1\n    title: address comments\n    description: fix\n    agent: dev\n    repository: app\nEOF\nsleep 60\n",
            item.id
        ),
    );

    let receiver = s.review.start_review_receive(&item.id, Some("app")).unwrap();
    assert_eq!(receiver.parse_role(), Some("review-receiver"));

    // The cycle is visible immediately.
    let events = s.bed.ledger.read_item(&item.id).unwrap();
    let started = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::ReviewReceiveStarted {
                pr_number, repo, ..
            } => Some((*pr_number, repo.clone())),
            _ => None,
        })
        .expect("review_receive_started recorded");
    assert_eq!(started.0, Some(12));
    assert_eq!(started.1.as_deref(), Some("app"));

    // The receiver was started after the cycle event, under its
    // pre-allocated id.
    let cycle_index = events
        .iter()
        .position(|e| matches!(e.kind, EventKind::ReviewReceiveStarted { .. }))
        .unwrap();
    assert!(events[cycle_index..].iter().any(|e| {
        matches!(&e.kind, EventKind::AgentStarted { role, .. } if role == "review-receiver")
            && e.agent_id.as_ref() == Some(&receiver)
    }));

    // The old plan moved aside.
    assert!(!s.bed.layout.plan_file(&item.id).exists() || {
        // The receiver may already have written the new plan.
        let content = std::fs::read_to_string(s.bed.layout.plan_file(&item.id)).unwrap();
        content.contains("follow-up")
    });
    let archived = std::fs::read_dir(&workspace)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("plan_") && name.ends_with(".yaml")
        })
        .count();
    assert_eq!(archived, 1);

    // The watcher accepts the fresh plan and the cycle closes.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let events = s.bed.ledger.read_item(&item.id).unwrap();
        let plan_after_cycle = events
            .iter()
            .skip_while(|e| !matches!(e.kind, EventKind::ReviewReceiveStarted { .. }))
            .any(|e| matches!(e.kind, EventKind::PlanCreated { .. }));
        if plan_after_cycle {
            assert_eq!(derive_item_status(&events), ItemStatus::Ready);
            break;
        }
        assert!(Instant::now() < deadline, "cycle never produced a plan");
        std::thread::sleep(Duration::from_millis(100));
    }

    s.agents.stop_item_agents(&item.id);
}

#[test]
fn concurrent_requests_serialize_one_winner() {
    let s = stack();
    let item = completed_item(&s);

    // A receiver that stays busy keeps the cycle open while the loser of
    // the race validates.
    let workspace = s.bed.layout.workspace_root(&item.id);
    write_behavior(&workspace, MockRole::ReviewReceiver, "sleep 5");

    let review_a = Arc::clone(&s.review);
    let review_b = Arc::clone(&s.review);
    let id_a = item.id.clone();
    let id_b = item.id.clone();

    let a = std::thread::spawn(move || review_a.start_review_receive(&id_a, Some("app")));
    let b = std::thread::spawn(move || review_b.start_review_receive(&id_b, Some("app")));
    let results = [a.join().unwrap(), b.join().unwrap()];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    let validation_losses = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_validation()))
        .count();
    assert_eq!(wins, 1, "exactly one caller may open the cycle");
    assert_eq!(validation_losses, 1, "the loser sees a validation error");

    // The loser observed the winner's side effects, never a torn state:
    // one cycle event, one archived plan.
    let events = s.bed.ledger.read_item(&item.id).unwrap();
    let cycles = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ReviewReceiveStarted { .. }))
        .count();
    assert_eq!(cycles, 1);

    let archived = std::fs::read_dir(&workspace)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("plan_") && name.ends_with(".yaml")
        })
        .count();
    assert_eq!(archived, 1);

    s.agents.stop_item_agents(&item.id);
}
