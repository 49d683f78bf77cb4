use rust_stream_processing::EngineError;
use rust_stream_processing::backend::{
    BackendKind, InProcessBackend, ProcessingBackend, Session, SessionResults, create_backend, stream_through_backend,
};
use rust_stream_processing::config::PipelineOptions;
use rust_stream_processing::execution::{StreamJob, StreamingPipeline};
use rust_stream_processing::processing::Operation;
use rust_stream_processing::types::{Schema, Value};

const EMPLOYEES: &str = "tests/fixtures/employees.csv";

fn opts(chunk_bytes: usize) -> PipelineOptions {
    PipelineOptions {
        chunk_bytes,
        ..Default::default()
    }
}

fn op(s: &str) -> Operation {
    s.parse().unwrap()
}

#[test]
fn backend_results_match_the_pipeline() {
    for descriptor in ["passthrough", "filter:salary:60000", "groupby:department:salary"] {
        let (rows, out) = StreamingPipeline::new(PipelineOptions::default())
            .unwrap()
            .collect(StreamJob::new(EMPLOYEES, op(descriptor)))
            .unwrap();
        let expected = match out.groups {
            Some(table) => table.to_json().unwrap(),
            None => serde_json::Value::Array(
                rows.iter()
                    .map(|r| rust_stream_processing::ingestion::row_to_json(&out.schema, r).unwrap())
                    .collect(),
            ),
        };

        for chunk_bytes in [1, 5, 64, 4096] {
            let backend = InProcessBackend::new(&opts(chunk_bytes));
            let run = stream_through_backend(&backend, StreamJob::new(EMPLOYEES, op(descriptor)), &opts(chunk_bytes))
                .unwrap();
            assert_eq!(run.results.to_json().unwrap(), expected, "{descriptor} @ {chunk_bytes}");
            assert_eq!(backend.open_sessions(), 0);
        }
    }
}

#[test]
fn byte_chunk_progress_reaches_the_whole_file() {
    let total = std::fs::metadata(EMPLOYEES).unwrap().len();
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = std::sync::Arc::clone(&seen);
    let job = StreamJob::new(EMPLOYEES, op("passthrough"))
        .with_schema(Schema::employees())
        .on_progress(move |p| {
            record.lock().unwrap().push(*p);
            Ok(())
        });
    let backend = InProcessBackend::new(&opts(32));
    let run = stream_through_backend(&backend, job, &opts(32)).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len() as u64, run.chunks);
    assert_eq!(run.chunks, total.div_ceil(32));
    assert_eq!(seen.last().unwrap().bytes_processed, total);
    assert!(seen.windows(2).all(|w| w[0].bytes_processed < w[1].bytes_processed));
    assert_eq!(run.stats.rows_processed, 10);
}

#[test]
fn sessions_close_on_drop() {
    let backend = InProcessBackend::default();
    {
        let mut session = Session::open(&backend, &op("groupby:department:salary"), Some(&Schema::employees())).unwrap();
        session
            .push_chunk(b"name,age,salary,department\nA,1,10,X\nB,2,5,X\n")
            .unwrap();
        match session.drain_results().unwrap() {
            SessionResults::Groups(table) => assert_eq!(table.get(&Value::from("X")), Some(&Value::Int64(15))),
            other => panic!("expected groups, got {other:?}"),
        }
        assert_eq!(backend.open_sessions(), 1);
    }
    assert_eq!(backend.open_sessions(), 0);
}

#[test]
fn calls_after_shutdown_report_an_unavailable_engine() {
    let backend = InProcessBackend::default();
    let id = backend.open(&op("passthrough"), None).unwrap();
    backend.shutdown();
    assert!(matches!(
        backend.push_chunk(id, b"a,b\n1,2\n"),
        Err(EngineError::EngineUnavailable { .. })
    ));
    assert!(matches!(
        backend.open(&op("passthrough"), None),
        Err(EngineError::EngineUnavailable { .. })
    ));
}

#[test]
fn factory_builds_the_in_process_engine() {
    let backend = create_backend(BackendKind::InProcess, &PipelineOptions::default()).unwrap();
    let run = stream_through_backend(
        backend.as_ref(),
        StreamJob::new(EMPLOYEES, op("filter:age:40")),
        &PipelineOptions::default(),
    )
    .unwrap();
    let json = run.results.to_json().unwrap();
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["Carla", "Farid", "Jon"]);
}
