//! End-to-end behaviour of the component tree through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowrunner::{
    load_workflow, Error, Event, EventKind, ExecutionTimeline, FileStorage, Lifecycle,
    MemoryStorage, RunError, Status, Step, StepContext, Storage, Work, Workflow,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::time::sleep;

fn inc(id: &str) -> Step {
    Step::from_fn(id, |x| Ok(json!(x.as_i64().unwrap_or(0) + 1)))
}

fn double(id: &str) -> Step {
    Step::from_fn(id, |x| Ok(json!(x.as_i64().unwrap_or(0) * 2)))
}

fn counted(id: &str, calls: &Arc<AtomicUsize>) -> Step {
    let calls = Arc::clone(calls);
    Step::from_fn(id, move |x| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!(x.as_i64().unwrap_or(0) + 100))
    })
}

fn record_all(workflow: &Workflow) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    workflow.on_any(move |event| sink.lock().push(event.clone()));
    events
}

#[tokio::test]
async fn test_running_twice_returns_first_result() {
    let step = inc("s");
    let work = Work::new("w");
    work.add(inc("a"));
    let workflow = Workflow::new("wf");
    workflow.add({
        let w = Work::new("inner");
        w.add(inc("b"));
        w
    });

    assert_eq!(step.run(json!(1)).await.unwrap(), step.run(json!(9)).await.unwrap());
    assert_eq!(work.run(json!(1)).await.unwrap(), work.run(json!(9)).await.unwrap());
    assert_eq!(
        workflow.run(json!(1)).await.unwrap(),
        workflow.run(json!(9)).await.unwrap()
    );
    assert_eq!(step.output(), Some(json!(2)));
}

#[tokio::test]
async fn test_chain_five_plus_one_times_two() {
    let work = Work::new("math");
    work.add(inc("s1")).add(double("s2"));

    let snapshot = work.run(json!(5)).await.unwrap();
    assert_eq!(snapshot.output, Some(json!(12)));
}

#[tokio::test]
async fn test_fan_out_fan_in() {
    let w1 = Work::new("w1");
    w1.add(Step::new("slow_inc", |x: Value, _ctx: StepContext| async move {
        sleep(Duration::from_millis(40)).await;
        Ok(json!(x.as_i64().unwrap_or(0) + 1))
    }));
    let w2 = Work::new("w2");
    w2.add(double("dbl"));

    let workflow = Workflow::new("wf");
    workflow.add(w1).add(w2);

    let snapshot = workflow.run(json!(5)).await.unwrap();
    let output = snapshot.output.clone().unwrap();

    assert_eq!(output[0]["id"], "w1");
    assert_eq!(output[0]["output"], 6);
    assert_eq!(output[1]["id"], "w2");
    assert_eq!(output[1]["output"], 10);
    assert_eq!(output[0], serde_json::to_value(&snapshot.works[0]).unwrap());
}

#[tokio::test]
async fn test_fail_fast_within_work() {
    let calls = Arc::new(AtomicUsize::new(0));
    let work = Work::new("w");
    work.add(inc("ok"))
        .add(Step::from_fn("bad", |_| Err(RunError::from("exploded"))))
        .add(counted("later", &calls));

    let err = work.run(json!(1)).await.unwrap_err();
    assert_eq!(err.root_message(), "exploded");

    let snapshot = work.snapshot();
    assert_eq!(snapshot.status, Status::Failed);
    assert_eq!(snapshot.step("ok").unwrap().status, Status::Success);
    assert_eq!(snapshot.step("bad").unwrap().status, Status::Failed);
    assert_eq!(snapshot.step("later").unwrap().status, Status::Pending);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_error_propagates_through_every_level() {
    let work = Work::new("w");
    work.add(Step::from_fn("s", |_| Err(RunError::from("disk full"))));
    let workflow = Workflow::new("wf");
    workflow.add(work);

    let err = workflow.run(json!(null)).await.unwrap_err();
    assert!(matches!(err, Error::WorkflowFailed { .. }));
    assert_eq!(
        err.to_string(),
        "workflow 'wf' failed: work 'w' failed: step 's' failed: disk full"
    );

    let snapshot = workflow.snapshot();
    assert_eq!(snapshot.error.as_deref(), Some("disk full"));
    assert_eq!(snapshot.works[0].error.as_deref(), Some("disk full"));
    assert_eq!(snapshot.works[0].steps[0].error.as_deref(), Some("disk full"));
}

#[tokio::test]
async fn test_event_bubbling_order() {
    let work = Work::new("w");
    work.add(inc("s"));
    let workflow = Workflow::new("wf");
    workflow.add(work);
    let events = record_all(&workflow);

    workflow.run(json!(0)).await.unwrap();

    let names: Vec<String> = events.lock().iter().map(Event::name).collect();
    assert_eq!(
        names,
        vec![
            "workflow:start",
            "work:start",
            "step:start",
            "step:success",
            "work:success",
            "workflow:success",
        ]
    );
}

#[tokio::test]
async fn test_event_payloads_are_emitter_snapshots() {
    let work = Work::new("w");
    work.add(inc("s"));
    let workflow = Workflow::new("wf");
    workflow.add(work);
    let events = record_all(&workflow);

    workflow.run(json!(3)).await.unwrap();

    let events = events.lock();
    let step_success = events
        .iter()
        .find(|e| e.kind() == EventKind::step(Lifecycle::Success))
        .unwrap();
    match step_success {
        Event::Step { snapshot, .. } => {
            assert_eq!(snapshot.id, "s");
            assert_eq!(snapshot.output, Some(json!(4)));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let last = events.last().unwrap();
    assert_eq!(last.status(), Status::Success);
    assert_eq!(last.id(), "wf");
}

#[tokio::test]
async fn test_specific_listener_and_off() {
    let workflow = Workflow::new("wf");
    let work = Work::new("w");
    work.add(inc("a")).add(inc("b"));
    workflow.add(work);

    let started = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&started);
    let id = workflow.on(EventKind::step(Lifecycle::Start), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    workflow.run(json!(0)).await.unwrap();
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert!(workflow.off(id));
    assert!(!workflow.off(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_resume_does_not_change_output() {
    let make = || {
        Step::new("sleeper", |x: Value, _ctx: StepContext| async move {
            sleep(Duration::from_millis(100)).await;
            Ok(json!(x.as_i64().unwrap_or(0) * 3))
        })
    };

    let undisturbed = make().run(json!(7)).await.unwrap();

    let step = make();
    let runner = step.clone();
    let handle = tokio::spawn(async move { runner.run(json!(7)).await });
    sleep(Duration::from_millis(50)).await;

    assert_eq!(step.pause().await.status, Status::Paused);
    assert_eq!(step.resume().await.status, Status::Running);

    let resumed = handle.await.unwrap().unwrap();
    assert_eq!(resumed.output, undisturbed.output);
    assert_eq!(resumed.status, Status::Success);
}

#[tokio::test]
async fn test_stop_semantics() {
    let step = inc("s");
    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    step.on(EventKind::step(Lifecycle::Stop), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // Pending
    assert_eq!(step.stop().await.status, Status::Pending);
    // Success
    step.run(json!(0)).await.unwrap();
    assert_eq!(step.stop().await.status, Status::Success);
    // Failed
    let failing = Step::from_fn("f", |_| Err(RunError::from("no")));
    let _ = failing.run(json!(0)).await;
    assert_eq!(failing.stop().await.status, Status::Failed);

    assert_eq!(events.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_running_emits_stop() {
    let stopped = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&stopped);

    let step = Step::new("long", |x: Value, _ctx: StepContext| async move {
        sleep(Duration::from_millis(300)).await;
        Ok(x)
    });
    step.on(EventKind::step(Lifecycle::Stop), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let runner = step.clone();
    let handle = tokio::spawn(async move { runner.run(json!(0)).await });
    sleep(Duration::from_millis(30)).await;

    assert_eq!(step.stop().await.status, Status::Stopped);
    assert_eq!(handle.await.unwrap().unwrap().status, Status::Stopped);
    assert_eq!(stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_snapshot_round_trip_through_json() {
    let build = || {
        let work = Work::new("w").with_description("math");
        work.add(inc("a")).add(double("b"));
        let workflow = Workflow::new("wf").with_name("round trip");
        workflow.add(work);
        workflow
    };

    let original = build();
    original.run(json!(2)).await.unwrap();

    let text = serde_json::to_string(&original.snapshot()).unwrap();
    let parsed = serde_json::from_str(&text).unwrap();

    let copy = build();
    copy.restore(&parsed).unwrap();
    assert_eq!(copy.snapshot(), original.snapshot());
    assert_eq!(copy.work("w").unwrap().step("b").unwrap().output(), Some(json!(6)));
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_state() {
    let temp_dir = tempdir().unwrap();
    let first_calls = Arc::new(AtomicUsize::new(0));
    let second_calls = Arc::new(AtomicUsize::new(0));

    let build = |calls: &Arc<AtomicUsize>, fail: bool| {
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(temp_dir.path()));
        let workflow = Workflow::new("wf").with_storage(storage);

        let done = Work::new("done");
        done.add(counted("once", calls));

        let flaky = Work::new("flaky");
        flaky.add(counted("before", calls));
        if fail {
            flaky.add(Step::from_fn("fragile", |_| Err(RunError::from("transient"))));
        } else {
            flaky.add(inc("fragile"));
        }

        workflow.add(done).add(flaky);
        workflow
    };

    // First process: one work succeeds, the other fails partway
    let first = build(&first_calls, true);
    assert!(first.run(json!(1)).await.is_err());
    // The sibling work is detached on failure and settles on its own
    sleep(Duration::from_millis(50)).await;
    assert_eq!(first_calls.load(Ordering::SeqCst), 2);

    // Simulate an operator clearing the failure and re-running
    let storage = FileStorage::new(temp_dir.path());
    storage.delete("workflow:wf").await.unwrap();
    storage.delete("work:flaky").await.unwrap();
    storage.delete("step:fragile").await.unwrap();

    let second = build(&second_calls, false);
    let snapshot = second.run(json!(1)).await.unwrap();

    assert_eq!(snapshot.status, Status::Success);
    // Settled steps restored from their own keys are not run again
    assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    assert_eq!(snapshot.work("done").unwrap().output, Some(json!(101)));
    assert_eq!(snapshot.work("flaky").unwrap().output, Some(json!(102)));
}

#[tokio::test]
async fn test_interrupted_run_restarts_as_pending() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .set(
            "workflow:wf",
            json!({
                "id": "wf", "type": "workflow", "status": "paused", "input": 4,
                "works": [{
                    "id": "w", "type": "work", "status": "paused", "input": 4,
                    "steps": [{"id": "s", "type": "step", "status": "paused", "input": 4}]
                }]
            }),
        )
        .await
        .unwrap();

    let workflow = Workflow::new("wf").with_storage(storage.clone());
    let work = Work::new("w");
    work.add(double("s"));
    workflow.add(work);

    assert!(workflow.auto_restore().await.unwrap());
    assert_eq!(workflow.status(), Status::Pending);
    assert_eq!(workflow.work("w").unwrap().status(), Status::Pending);

    let snapshot = workflow.run(json!(4)).await.unwrap();
    assert_eq!(snapshot.works[0].output, Some(json!(8)));
}

#[tokio::test]
async fn test_yaml_workflow_end_to_end() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("pipeline.yaml");
    std::fs::write(
        &path,
        r#"
id: pipeline
input: 5
works:
  - id: math
    steps:
      - id: inc
        command: echo $(( {input} + 1 ))
      - id: double
        command: echo $(( {input} * 2 ))
  - id: text
    steps:
      - id: shout
        command: echo "value={input}"
"#,
    )
    .unwrap();

    let definition = load_workflow(&path).unwrap();
    let workflow = definition.build(Some(Arc::new(FileStorage::new(temp_dir.path().join("state")))));
    let timeline = ExecutionTimeline::new();
    timeline.attach(workflow.events());

    let snapshot = workflow.run(definition.input.clone().unwrap()).await.unwrap();
    assert_eq!(snapshot.work("math").unwrap().output, Some(json!(12)));
    assert_eq!(snapshot.work("text").unwrap().output, Some(json!("value=5")));
    assert!(temp_dir.path().join("state/workflow_pipeline.json").exists());

    let durations = timeline.durations(flowrunner::ComponentKind::Step);
    assert_eq!(durations.len(), 3);
}
