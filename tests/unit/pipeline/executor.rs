//! Tests for local, queued and dry-run phase execution

#[cfg(test)]
mod tests {
    use indicatif::ProgressBar;
    use ndarray::Array2;
    use stackalign::AlignError;
    use stackalign::model::predictor::ModelRegistry;
    use stackalign::pipeline::barrier::BarrierConfig;
    use stackalign::pipeline::context::TaskContext;
    use stackalign::pipeline::executor::{
        DryRunExecutor, LocalExecutor, PhaseExecutor, QueuedExecutor, Worker,
    };
    use stackalign::pipeline::queue::{DirectoryQueue, MemoryQueue, TaskQueue};
    use stackalign::pipeline::scheduler::Phase;
    use stackalign::pipeline::tasks::{ChunkTask, CopyTask, Task};
    use stackalign::spatial::bbox::BoundingBox;
    use stackalign::store::tensor_store::LayerHandle;
    use stackalign::store::volumes::{read_image, write_plane};
    use std::sync::Arc;
    use std::time::Duration;

    const PREFIX: &str = "dst/markers/copy";

    fn quick() -> BarrierConfig {
        BarrierConfig::new(Duration::from_millis(200), Duration::from_millis(5))
    }

    fn source() -> LayerHandle {
        LayerHandle::image("src/image", [16, 16])
    }

    fn destination() -> LayerHandle {
        LayerHandle::image("dst/image", [16, 16])
    }

    fn chunks() -> Vec<BoundingBox> {
        vec![
            BoundingBox::new(0..16, 0..16),
            BoundingBox::new(16..32, 0..16),
            BoundingBox::new(0..16, 16..32),
            BoundingBox::new(16..32, 16..32),
        ]
    }

    fn seeded_context() -> TaskContext {
        let ctx = TaskContext::in_memory(ModelRegistry::with_builtin(4));
        let plane = Array2::from_shape_fn((32, 32), |(r, c)| (r + c) as f32);
        write_plane(ctx.store(), &source(), 0, &BoundingBox::new(0..32, 0..32), 0, &plane.view())
            .expect("plane written");
        ctx
    }

    fn copy_phase(dst: &LayerHandle) -> Phase {
        Phase {
            name: "copy".to_string(),
            prefix: PREFIX.to_string(),
            tasks: chunks()
                .into_iter()
                .map(|bbox| {
                    ChunkTask::new(
                        PREFIX,
                        Task::Copy(CopyTask {
                            src: source(),
                            src_z: 0,
                            dst: dst.clone(),
                            dst_z: 0,
                            bbox,
                            mip: 0,
                        }),
                    )
                })
                .collect(),
        }
    }

    fn assert_copied(ctx: &TaskContext) {
        let bbox = BoundingBox::new(0..32, 0..32);
        let copied = read_image(ctx.store(), &destination(), 0, &bbox, 0).expect("readable");
        let original = read_image(ctx.store(), &source(), 0, &bbox, 0).expect("readable");
        assert_eq!(copied, original);
    }

    // Tests local execution runs every task and a rerun skips them all
    // Verified by ignoring existing markers
    #[test]
    fn test_local_executor_resumes() {
        let ctx = seeded_context();
        let executor = LocalExecutor::new(ctx.clone(), 2, quick()).expect("pool built");
        let phase = copy_phase(&destination());

        let first = executor.run_phase(&phase, &ProgressBar::hidden()).expect("phase runs");
        assert_eq!((first.executed, first.skipped), (4, 0));
        assert_eq!(ctx.markers.count_markers(PREFIX).ok(), Some(4));
        assert_copied(&ctx);

        let again = executor.run_phase(&phase, &ProgressBar::hidden()).expect("phase runs");
        assert_eq!((again.executed, again.skipped), (0, 4));
        assert_eq!(again.name, "copy");
    }

    // Tests a failing task aborts the phase without leaving its marker
    // Verified by writing the marker before executing
    #[test]
    fn test_local_executor_failure() {
        let ctx = seeded_context();
        let executor = LocalExecutor::new(ctx.clone(), 1, quick()).expect("pool built");
        let phase = copy_phase(&LayerHandle::field("dst/field", [16, 16]));
        let result = executor.run_phase(&phase, &ProgressBar::hidden());
        assert!(matches!(result, Err(AlignError::TaskFailed { .. })));
        assert_eq!(ctx.markers.count_markers(PREFIX).ok(), Some(0));
    }

    // Tests an inline worker drains the queue before the barrier passes
    // Verified by checking the marker count before draining
    #[test]
    fn test_queued_executor_with_inline_worker() {
        let ctx = seeded_context();
        let queue = Arc::new(MemoryQueue::default());
        let executor = QueuedExecutor::new(queue.clone(), ctx.markers.clone(), quick())
            .with_inline_worker(Worker::new(ctx.clone(), queue.clone()));

        let report = executor
            .run_phase(&copy_phase(&destination()), &ProgressBar::hidden())
            .expect("phase runs");
        assert_eq!(report.executed, 4);
        assert!(queue.is_drained().expect("queue readable"));
        assert_copied(&ctx);
    }

    // Tests queued phases without workers time out at the barrier
    // Verified by returning once the tasks are enqueued
    #[test]
    fn test_queued_executor_without_worker_times_out() {
        let ctx = seeded_context();
        let queue = Arc::new(MemoryQueue::default());
        let executor = QueuedExecutor::new(queue.clone(), ctx.markers.clone(), quick());
        let result = executor.run_phase(&copy_phase(&destination()), &ProgressBar::hidden());
        assert!(matches!(result, Err(AlignError::BarrierTimeout { expected: 4, found: 0, .. })));
        assert_eq!(queue.outstanding().ok(), Some(4));
    }

    // Tests worker failures surface at the orchestrator
    // Verified by not checking queue failures while polling
    #[test]
    fn test_queued_executor_reports_failures() {
        let ctx = seeded_context();
        let queue = Arc::new(MemoryQueue::default());
        let executor = QueuedExecutor::new(queue.clone(), ctx.markers.clone(), quick())
            .with_inline_worker(Worker::new(ctx.clone(), queue.clone()));
        let phase = copy_phase(&LayerHandle::field("dst/field", [16, 16]));
        match executor.run_phase(&phase, &ProgressBar::hidden()) {
            Err(AlignError::TaskFailed { task, .. }) => assert!(task.contains("4 failed")),
            other => panic!("Expected a task failure, got {other:?}"),
        }
    }

    // Tests failures left in the queue by earlier phases do not abort later ones
    // Verified by checking every recorded failure while polling
    #[test]
    fn test_queued_executor_ignores_earlier_failures() {
        let dir = tempfile::tempdir().expect("temp dir");
        let ctx = seeded_context();
        let queue = Arc::new(DirectoryQueue::open(dir.path()).expect("queue opened"));
        let executor = QueuedExecutor::new(queue.clone(), ctx.markers.clone(), quick())
            .with_inline_worker(Worker::new(ctx.clone(), queue.clone()));

        let broken = copy_phase(&LayerHandle::field("dst/field", [16, 16]));
        assert!(executor.run_phase(&broken, &ProgressBar::hidden()).is_err());
        assert_eq!(queue.failures().map(|f| f.len()).ok(), Some(4));

        let phase = copy_phase(&destination());
        let first = executor.run_phase(&phase, &ProgressBar::hidden()).expect("phase runs");
        assert_eq!((first.executed, first.skipped), (4, 0));
        assert_copied(&ctx);

        let again = executor.run_phase(&phase, &ProgressBar::hidden()).expect("completed phase resumes");
        assert_eq!((again.executed, again.skipped), (0, 4));
        assert_eq!(queue.failures().map(|f| f.len()).ok(), Some(4));
    }

    // Tests a phase with every marker present still waits for the queue to empty
    // Verified by returning as soon as the markers are counted
    #[test]
    fn test_queued_executor_waits_for_drain() {
        let ctx = seeded_context();
        let phase = copy_phase(&destination());
        LocalExecutor::new(ctx.clone(), 1, quick())
            .expect("pool built")
            .run_phase(&phase, &ProgressBar::hidden())
            .expect("phase runs");

        let queue = Arc::new(MemoryQueue::default());
        queue.enqueue("left over from an earlier run").expect("enqueued");
        let waiting = QueuedExecutor::new(queue.clone(), ctx.markers.clone(), quick());
        match waiting.run_phase(&phase, &ProgressBar::hidden()) {
            Err(AlignError::QueueNotDrained { prefix, outstanding, .. }) => {
                assert_eq!((prefix.as_str(), outstanding), (PREFIX, 1));
            }
            other => panic!("Expected the queue wait to time out, got {other:?}"),
        }

        // The leftover fails on the worker but is not a task of this phase
        let draining = QueuedExecutor::new(queue.clone(), ctx.markers.clone(), quick())
            .with_inline_worker(Worker::new(ctx.clone(), queue.clone()));
        let report = draining.run_phase(&phase, &ProgressBar::hidden()).expect("phase passes");
        assert_eq!((report.executed, report.skipped), (0, 4));
        assert!(queue.is_drained().expect("queue readable"));
        assert_eq!(queue.failures().map(|f| f.len()).ok(), Some(1));
    }

    // Tests a worker fails leases it cannot decode and keeps going
    // Verified by propagating decode errors from run_one
    #[test]
    fn test_worker_rejects_malformed_payload() {
        let ctx = seeded_context();
        let queue = Arc::new(MemoryQueue::default());
        queue.enqueue("not json").expect("enqueued");
        let worker = Worker::new(ctx, queue.clone());
        assert_eq!(worker.run_until_drained().ok(), Some(1));
        assert_eq!(queue.failures().map(|f| f.len()).ok(), Some(1));
    }

    // Tests a dry run records task kinds and sections without executing
    // Verified by executing tasks in the dry run
    #[test]
    fn test_dry_run_records() {
        let ctx = seeded_context();
        let executor = DryRunExecutor::default();
        let report = executor
            .run_phase(&copy_phase(&destination()), &ProgressBar::hidden())
            .expect("phase recorded");
        assert_eq!(report.executed, 0);

        let records = executor.records().expect("records readable");
        let record = records.first().expect("one record");
        assert_eq!(record.prefix, PREFIX);
        assert_eq!(record.kinds.get("copy"), Some(&4));
        assert_eq!(record.sections, vec![0]);
        assert_eq!(ctx.markers.count_markers(PREFIX).ok(), Some(0));
    }
}
