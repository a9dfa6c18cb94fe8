//! Tests for chunk task execution, naming and serialization

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use stackalign::AlignError;
    use stackalign::field::tensor::Field;
    use stackalign::model::predictor::ModelRegistry;
    use stackalign::pipeline::context::TaskContext;
    use stackalign::pipeline::tasks::{
        ChunkTask, ComposeTask, ComputeFieldTask, CopyTask, CorrelateTask, DownsampleTask,
        InvertTask, Task, VectorVoteTask,
    };
    use stackalign::spatial::bbox::BoundingBox;
    use stackalign::store::tensor_store::LayerHandle;
    use stackalign::store::volumes::{
        FieldRef, ImageRef, read_field, read_image, write_field, write_plane,
    };
    use stackalign::voting::consensus::VoteConfig;

    const CHUNK: BoundingBox = BoundingBox::new(16..48, 16..48);

    fn texture(x: i64, y: i64) -> f32 {
        let (x, y) = (x as f32, y as f32);
        60.0f32.mul_add((0.3 * x + 0.1 * y).sin(), 128.0) + 40.0 * (0.23 * y - 0.17 * x).cos()
    }

    fn context() -> TaskContext {
        TaskContext::in_memory(ModelRegistry::with_builtin(8))
    }

    fn images() -> LayerHandle {
        LayerHandle::image("src/image", [16, 16])
    }

    fn store_section(ctx: &TaskContext, layer: &LayerHandle, z: i64, shift: [i64; 2]) {
        let plane = Array2::from_shape_fn((64, 64), |(r, c)| {
            texture(c as i64 - shift[0], r as i64 - shift[1])
        });
        write_plane(ctx.store(), layer, 0, &BoundingBox::new(0..64, 0..64), z, &plane.view())
            .expect("plane written");
    }

    fn store_uniform(ctx: &TaskContext, layer: &LayerHandle, z: i64, value: [f32; 2]) {
        write_field(ctx.store(), layer, &CHUNK, z, &Field::uniform(32, 32, 0, value))
            .expect("field written");
    }

    fn centre(field: &Field) -> [f32; 2] {
        field.at(field.rows() / 2, field.cols() / 2)
    }

    fn copy_task() -> Task {
        Task::Copy(CopyTask {
            src: images(),
            src_z: 2,
            dst: LayerHandle::image("dst/block/even/image", [16, 16]),
            dst_z: 2,
            bbox: CHUNK,
            mip: 0,
        })
    }

    // Tests tasks survive JSON with a kind tag
    // Verified by removing the serde tag from Task
    #[test]
    fn test_json_round_trip() {
        let task = ChunkTask::new("dst/markers/block/step_000/copy", copy_task());
        let json = task.to_json().expect("serializable");
        assert!(json.contains("\"kind\":\"copy\""));
        assert_eq!(ChunkTask::from_json(&json).expect("decodable"), task);
        assert!(matches!(
            ChunkTask::from_json("{\"prefix\":\"p\",\"task\":{\"kind\":\"teleport\"}}"),
            Err(AlignError::Serialization { .. })
        ));
    }

    // Tests marker keys are unique per chunk, section and target
    // Verified by leaving the target out of compute-field markers
    #[test]
    fn test_marker_keys_and_sections() {
        let copy = ChunkTask::new("dst/markers/copy", copy_task());
        assert_eq!(copy.marker_key(), "dst/markers/copy/16_48_16_48_2");
        assert_eq!(copy.task.kind(), "copy");
        assert_eq!(copy.task.bbox(), &CHUNK);

        let compute = Task::ComputeField(ComputeFieldTask {
            source: ImageRef::new(images(), 5),
            target: ImageRef::new(images(), 4),
            dst: LayerHandle::field("pairs/-1", [16, 16]),
            bbox: CHUNK,
            mip: 0,
            pad: 16,
            model: "translation".to_string(),
            prev_field: Some(FieldRef::new(LayerHandle::field("f", [16, 16]), 4, 0)),
            backups: vec![ImageRef::new(images(), 3)],
            reference_bbox: BoundingBox::new(0..64, 0..64),
        });
        assert_eq!(compute.marker_leaf(), "16_48_16_48_5_4");
        assert_eq!(compute.sections(), vec![3, 4, 5]);
    }

    // Tests a copy moves a chunk between layers and refuses channel mismatches
    // Verified by writing the copy at the source section
    #[test]
    fn test_copy_task() {
        let ctx = context();
        store_section(&ctx, &images(), 2, [0, 0]);
        ChunkTask::new("m", copy_task()).execute(&ctx).expect("copy succeeds");
        let dst = LayerHandle::image("dst/block/even/image", [16, 16]);
        let copied = read_image(ctx.store(), &dst, 0, &CHUNK, 2).expect("readable");
        let original = read_image(ctx.store(), &images(), 0, &CHUNK, 2).expect("readable");
        assert_eq!(copied, original);

        let Task::Copy(mut bad) = copy_task() else {
            panic!("Expected a copy task");
        };
        bad.dst = LayerHandle::field("f", [16, 16]);
        match ChunkTask::new("m", Task::Copy(bad)).execute(&ctx) {
            Err(AlignError::TaskFailed { task, source }) => {
                assert!(task.starts_with("copy m/"));
                assert!(matches!(*source, AlignError::InvalidParameter { .. }));
            }
            other => panic!("Expected a task failure, got {other:?}"),
        }
    }

    // Tests a computed field maps the target chunk into the source
    // Verified by writing the relative prediction without conversion
    #[test]
    fn test_compute_field_task() {
        let ctx = context();
        store_section(&ctx, &images(), 1, [3, -2]);
        store_section(&ctx, &images(), 0, [0, 0]);
        let dst = LayerHandle::field("pairs/-1", [16, 16]);
        let task = Task::ComputeField(ComputeFieldTask {
            source: ImageRef::new(images(), 1),
            target: ImageRef::new(images(), 0),
            dst: dst.clone(),
            bbox: CHUNK,
            mip: 0,
            pad: 16,
            model: "translation".to_string(),
            prev_field: None,
            backups: Vec::new(),
            reference_bbox: BoundingBox::new(0..64, 0..64),
        });
        task.execute(&ctx).expect("prediction succeeds");
        let field = read_field(ctx.store(), &dst, 0, &CHUNK, 1).expect("readable");
        let [dx, dy] = centre(&field);
        assert!((dx - 3.0).abs() < 0.3 && (dy + 2.0).abs() < 0.3, "got ({dx}, {dy})");

        let Task::ComputeField(mut unknown) = task else {
            panic!("Expected a compute task");
        };
        unknown.model = "unregistered".to_string();
        assert!(Task::ComputeField(unknown).execute(&ctx).is_err());
    }

    // Tests votes accept direct candidates and composed chains
    // Verified by composing chains in list order
    #[test]
    fn test_vector_vote_task() {
        let ctx = context();
        let pairs = LayerHandle::field("pairs", [16, 16]);
        store_uniform(&ctx, &pairs, 10, [1.0, 0.0]);
        store_uniform(&ctx, &pairs, 11, [0.0, 2.0]);
        let dst = LayerHandle::field("voted", [16, 16]);
        let confidence = LayerHandle::scalar("confidence", [16, 16]);
        let task = VectorVoteTask {
            candidates: vec![vec![
                FieldRef::new(pairs.clone(), 10, 0),
                FieldRef::new(pairs, 11, 0),
            ]],
            dst: dst.clone(),
            confidence: Some(confidence.clone()),
            z: 7,
            bbox: CHUNK,
            mip: 0,
            pad: 8,
            vote: VoteConfig::for_mip(0),
        };
        Task::VectorVote(task.clone()).execute(&ctx).expect("vote succeeds");
        let [dx, dy] = centre(&read_field(ctx.store(), &dst, 0, &CHUNK, 7).expect("readable"));
        assert!((dx - 1.0).abs() < 1e-3 && (dy - 2.0).abs() < 1e-3);
        let weights = read_image(ctx.store(), &confidence, 0, &CHUNK, 7).expect("readable");
        assert!(weights.iter().all(|w| (*w - 1.0).abs() < 1e-5));

        let empty = VectorVoteTask {
            candidates: Vec::new(),
            ..task
        };
        let failure = ChunkTask::new("m", Task::VectorVote(empty)).execute(&ctx);
        assert!(matches!(
            failure,
            Err(AlignError::TaskFailed { source, .. }) if matches!(*source, AlignError::NoCandidates { z: 7 })
        ));
    }

    // Tests compose and invert tasks on uniform fields
    // Verified by swapping outer and inner reads
    #[test]
    fn test_compose_and_invert_tasks() {
        let ctx = context();
        let fields = LayerHandle::field("fields", [16, 16]);
        store_uniform(&ctx, &fields, 0, [2.0, 1.0]);
        store_uniform(&ctx, &fields, 1, [-0.5, 3.0]);
        let out = LayerHandle::field("out", [16, 16]);

        Task::Compose(ComposeTask {
            outer: FieldRef::new(fields.clone(), 0, 0),
            inner: FieldRef::new(fields.clone(), 1, 0),
            dst: out.clone(),
            dst_z: 5,
            bbox: CHUNK,
            mip: 0,
            pad: 8,
        })
        .execute(&ctx)
        .expect("compose succeeds");
        let [dx, dy] = centre(&read_field(ctx.store(), &out, 0, &CHUNK, 5).expect("readable"));
        assert!((dx - 1.5).abs() < 1e-3 && (dy - 4.0).abs() < 1e-3);

        Task::Invert(InvertTask {
            field: FieldRef::new(fields, 0, 0),
            dst: out.clone(),
            dst_z: 6,
            bbox: CHUNK,
            mip: 0,
            pad: 8,
        })
        .execute(&ctx)
        .expect("invert succeeds");
        let [ix, iy] = centre(&read_field(ctx.store(), &out, 0, &CHUNK, 6).expect("readable"));
        assert!((ix + 2.0).abs() < 0.3 && (iy + 1.0).abs() < 0.3, "got ({ix}, {iy})");
    }

    // Tests downsampling builds the next level and mip 0 is rejected
    // Verified by reading the finer level at the written mip
    #[test]
    fn test_downsample_task() {
        let ctx = context();
        let layer = images();
        let plane = Array2::from_shape_fn((32, 32), |(r, c)| if (r + c) % 2 == 0 { 100.0 } else { 50.0 });
        write_plane(ctx.store(), &layer, 0, &CHUNK, 3, &plane.view()).expect("plane written");
        let task = DownsampleTask {
            layer: layer.clone(),
            z: 3,
            bbox: CHUNK,
            mip: 1,
        };
        Task::Downsample(task.clone()).execute(&ctx).expect("downsample succeeds");
        let coarse = read_image(ctx.store(), &layer, 1, &CHUNK, 3).expect("readable");
        assert_eq!(coarse.dim(), (16, 16));
        assert!(coarse.iter().all(|v| *v == 75.0));

        let finest = DownsampleTask { mip: 0, ..task };
        assert!(Task::Downsample(finest).execute(&ctx).is_err());
    }

    // Tests neighbour correlation scores one value per block
    // Verified by correlating a section with itself
    #[test]
    fn test_correlate_task() {
        let ctx = context();
        store_section(&ctx, &images(), 0, [0, 0]);
        store_section(&ctx, &images(), 1, [0, 0]);
        let dst = LayerHandle::scalar("qc", [16, 16]);
        Task::Correlate(CorrelateTask {
            image: images(),
            z: 1,
            neighbour: 0,
            dst: dst.clone(),
            bbox: CHUNK,
            mip: 0,
            dst_mip: 3,
        })
        .execute(&ctx)
        .expect("correlation succeeds");
        let scores = read_image(ctx.store(), &dst, 3, &CHUNK, 1).expect("readable");
        assert_eq!(scores.dim(), (4, 4));
        assert!(scores.iter().all(|s| (*s - 1.0).abs() < 1e-4));
    }
}
