//! Drives the real `appose-worker` binary through the parent-side API

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use appose::{
    EnvironmentResolver, ExistingInterpreter, Inputs, NdArray, RestartPolicy, Service,
    ServiceConfig, TaskError, TaskEvent, TaskEventKind, TaskStatus, Value, WorkerCommand,
};

const WORKER: &str = env!("CARGO_BIN_EXE_appose-worker");

fn worker() -> WorkerCommand {
    WorkerCommand::new(WORKER).with_args(["--log", "debug"])
}

fn config() -> ServiceConfig {
    ServiceConfig::default()
        .with_shutdown_grace(Duration::from_secs(2))
        .with_cancel_grace(Duration::from_secs(5))
}

async fn spawn() -> Service {
    Service::spawn(&worker(), config()).await.unwrap()
}

#[tokio::test]
async fn rotates_an_image_in_shared_memory() {
    let service = spawn().await;
    let ramp: Vec<f64> = (0..16).map(f64::from).collect();
    let image = NdArray::from_slice(vec![4, 4], &ramp).unwrap();

    let task = service
        .run("rotated = rot90(image)\noutput rotated", Inputs::new().array("image", image))
        .await
        .unwrap();
    assert_eq!(task.wait_for(None).await.unwrap(), TaskStatus::Complete);

    let rotated = task.outputs().unwrap().array("rotated").unwrap();
    assert_eq!(rotated.shape(), &[4, 4]);
    assert!(rotated.is_owner());
    // rotated[i][j] = image[j][3 - i]
    assert_eq!(
        rotated.as_slice::<f64>().unwrap(),
        &[
            3.0, 7.0, 11.0, 15.0, //
            2.0, 6.0, 10.0, 14.0, //
            1.0, 5.0, 9.0, 13.0, //
            0.0, 4.0, 8.0, 12.0,
        ]
    );

    let inputs = task.take_input_arrays().unwrap();
    assert_eq!(inputs["image"].as_slice::<f64>().unwrap(), ramp.as_slice());
    service.close().await;
}

#[tokio::test]
async fn tasks_run_concurrently() {
    let service = spawn().await;
    let started = Instant::now();
    let a = service.run("sleep(1000)\noutput n = 1", Inputs::new()).await.unwrap();
    let b = service.run("sleep(1000)\noutput n = 2", Inputs::new()).await.unwrap();

    let (ra, rb) = tokio::join!(a.wait_for(None), b.wait_for(None));
    assert_eq!(ra.unwrap(), TaskStatus::Complete);
    assert_eq!(rb.unwrap(), TaskStatus::Complete);
    assert!(started.elapsed() < Duration::from_millis(1900), "{:?}", started.elapsed());

    assert_eq!(a.outputs().unwrap().get("n"), Some(&Value::Int(1)));
    assert_eq!(b.outputs().unwrap().get("n"), Some(&Value::Int(2)));
    service.close().await;
}

#[tokio::test]
async fn cancel_stops_a_sleeping_task() {
    let service = spawn().await;
    let task = service.run("sleep(60000)", Inputs::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    task.cancel().await.unwrap();
    assert_eq!(task.wait_for(Some(Duration::from_secs(5))).await.unwrap(), TaskStatus::Canceled);
    assert!(service.is_active());
    service.close().await;
}

#[tokio::test]
async fn a_failing_task_leaves_the_service_usable() {
    let service = spawn().await;
    let bad = service.run("fail(\"bad input\")", Inputs::new()).await.unwrap();
    assert_eq!(
        bad.wait_for(None).await.unwrap_err(),
        TaskError::Failed("bad input".into())
    );

    let good = service
        .run("output total = add(x, 1)", Inputs::new().value("x", 41))
        .await
        .unwrap();
    good.wait_for(None).await.unwrap();
    assert_eq!(good.outputs().unwrap().get("total"), Some(&Value::Int(42)));
    service.close().await;
}

#[tokio::test]
async fn a_worker_exit_crashes_pending_tasks() {
    let service = spawn().await;
    let sleeper = service.run("sleep(60000)", Inputs::new()).await.unwrap();
    let crasher = service.run("crash(3)", Inputs::new()).await.unwrap();

    for task in [&sleeper, &crasher] {
        let err = task.wait_for(Some(Duration::from_secs(5))).await.unwrap_err();
        assert!(matches!(err, TaskError::WorkerCrashed(_)), "{err}");
        assert_eq!(task.status(), TaskStatus::Failed);
    }
    assert!(service.crashed());
    assert!(service.task("output x = 1", Inputs::new()).is_err());
}

#[tokio::test]
async fn a_malformed_frame_is_a_protocol_error() {
    let service = spawn().await;
    let task = service.run("garbage()\nsleep(60000)", Inputs::new()).await.unwrap();
    let err = task.wait_for(Some(Duration::from_secs(5))).await.unwrap_err();
    assert!(matches!(err, TaskError::Protocol(_)), "{err}");
    assert!(!service.is_active());
}

#[tokio::test]
async fn progress_updates_reach_listeners() {
    let service = spawn().await;
    let task = service
        .task(
            "update(\"loading\", 1, 3)\nupdate(\"rotating\", 2, 3)\nupdate(\"saving\", 3, 3)",
            Inputs::new(),
        )
        .unwrap();
    let events: Arc<Mutex<Vec<TaskEvent>>> = Arc::default();
    let sink = events.clone();
    task.on_event(move |event| sink.lock().unwrap().push(event.clone()));

    task.start().await.unwrap();
    task.wait_for(None).await.unwrap();

    let messages: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|event| event.kind == TaskEventKind::Update)
        .filter_map(|event| event.message.clone())
        .collect();
    assert_eq!(messages, vec!["loading", "rotating", "saving"]);
    assert_eq!(task.progress(), (3, 3));
    service.close().await;
}

#[tokio::test]
async fn wait_timeout_leaves_the_task_running() {
    let service = spawn().await;
    let task = service.run("sleep(500)\noutput done = true", Inputs::new()).await.unwrap();

    let err = task.wait_for(Some(Duration::from_millis(50))).await.unwrap_err();
    assert_eq!(err, TaskError::Timeout(Duration::from_millis(50)));
    assert_eq!(task.status(), TaskStatus::Running);

    assert_eq!(task.wait_for(None).await.unwrap(), TaskStatus::Complete);
    service.close().await;
}

#[tokio::test]
async fn close_refuses_new_tasks() {
    let service = spawn().await;
    service.close().await;
    service.close().await;
    assert!(!service.is_active());
    assert!(!service.crashed());
    assert!(service.task("output x = 1", Inputs::new()).is_err());
}

#[tokio::test]
async fn environments_respawn_crashed_workers() {
    let root = tempfile::tempdir().unwrap();
    let resolver = EnvironmentResolver::new(root.path(), ExistingInterpreter::new(worker()))
        .with_service_config(config())
        .with_restart_policy(RestartPolicy::immediate(1));

    let environment = resolver
        .resolve_yaml("name: e2e\ndependencies:\n  - python=3.11\n")
        .await
        .unwrap();
    assert!(environment.dir().join("environment.json").is_file());

    let first = environment.service().await.unwrap();
    let crash = first.run("crash(1)", Inputs::new()).await.unwrap();
    assert!(crash.wait_for(Some(Duration::from_secs(5))).await.is_err());

    let second = environment.service().await.unwrap();
    assert_ne!(first.id(), second.id());
    let task = second.run("output ok = true", Inputs::new()).await.unwrap();
    task.wait_for(None).await.unwrap();
    assert_eq!(task.outputs().unwrap().get("ok"), Some(&Value::Bool(true)));

    environment.close().await;
    assert!(environment.service().await.is_err());
}
