//! Tests for argument parsing and the subcommand runner

#[cfg(test)]
mod tests {
    use clap::Parser;
    use ndarray::Array2;
    use stackalign::io::cli::{App, Cli, Command};
    use stackalign::io::configuration::AlignConfig;
    use stackalign::io::image::{read_png, write_png};
    use std::path::Path;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("arguments parse")
    }

    // Tests align flags parse and global flags work after the subcommand
    // Verified by making verbose a top-level only flag
    #[test]
    fn test_parse_align() {
        let cli = parse(&[
            "stackalign", "align", "-s", "store", "-c", "run.json", "--restart", "3", "-t", "4",
            "--flip-average", "-v", "-q",
        ]);
        assert!(cli.verbose);
        assert!(!cli.should_show_progress());
        assert_eq!(cli.log_options().default_directive(), "debug");
        let Command::Align(args) = cli.command else {
            panic!("Expected the align subcommand");
        };
        assert_eq!(args.store, Path::new("store"));
        assert_eq!(args.restart, Some(3));
        assert_eq!(args.threads, Some(4));
        assert!(args.flip_average && !args.dry_run && args.queue.is_none());
    }

    // Tests the inline worker only makes sense with a queue
    // Verified by removing requires = "queue"
    #[test]
    fn test_inline_worker_requires_queue() {
        let without = Cli::try_parse_from(["stackalign", "align", "-s", "s", "-c", "c", "--inline-worker"]);
        assert!(without.is_err());
        let with = parse(&["stackalign", "align", "-s", "s", "-c", "c", "--queue", "q", "--inline-worker"]);
        assert!(matches!(with.command, Command::Align(args) if args.inline_worker));
    }

    // Tests flags override the loaded configuration without clearing it
    // Verified by assigning the flags instead of or-ing them
    #[test]
    fn test_apply_overrides() {
        let cli = parse(&["stackalign", "pairwise", "-s", "s", "-c", "c", "--vote", "--dry-run"]);
        let Command::Pairwise(args) = cli.command else {
            panic!("Expected the pairwise subcommand");
        };
        let mut config = AlignConfig {
            flip_average: true,
            restart: 2,
            ..AlignConfig::default()
        };
        args.apply(&mut config);
        assert!(config.pairwise_vote && config.dry_run && config.flip_average);
        assert_eq!(config.restart, 2);
        assert_eq!(config.threads, 0);
    }

    // Tests import and export defaults and the comma separated region
    // Verified by changing the default import layer
    #[test]
    fn test_parse_import_export() {
        let import = parse(&["stackalign", "import", "-s", "s", "-d", "pngs"]);
        let Command::Import(args) = import.command else {
            panic!("Expected the import subcommand");
        };
        assert_eq!(args.layer, "src/image");
        assert_eq!((args.z_start, args.chunk), (0, 128));

        let export = parse(&["stackalign", "export", "-s", "s", "-z", "4", "-b", "0,0,64,32", "-o", "out.png"]);
        let Command::Export(args) = export.command else {
            panic!("Expected the export subcommand");
        };
        assert_eq!(args.layer, "dst/image");
        assert_eq!(args.bbox, vec![0, 0, 64, 32]);
        assert_eq!((args.z, args.mip), (4, 0));

        assert!(Cli::try_parse_from(["stackalign", "export", "-s", "s", "-z", "4", "-b", "0,0,64", "-o", "o.png"]).is_err());
    }

    // Tests sections survive an import then export through the file store
    // Verified by exporting from the wrong section
    #[test]
    fn test_import_then_export() {
        let dir = tempfile::tempdir().expect("temp dir");
        let pngs = dir.path().join("pngs");
        let plane = Array2::from_shape_fn((16, 32), |(r, c)| (r * 7 + c) as f32);
        write_png(&pngs.join("a.png"), &plane.view()).expect("png written");
        write_png(&pngs.join("b.png"), &(&plane + 50.0).view()).expect("png written");

        let store = dir.path().join("store");
        let store_arg = store.to_string_lossy().to_string();
        let pngs_arg = pngs.to_string_lossy().to_string();
        App::new(parse(&["stackalign", "import", "-q", "-s", &store_arg, "-d", &pngs_arg, "-z", "10", "--chunk", "16"]))
            .run()
            .expect("import succeeds");

        let out = dir.path().join("z11.png");
        let out_arg = out.to_string_lossy().to_string();
        App::new(parse(&[
            "stackalign", "export", "-q", "-s", &store_arg, "-l", "src/image", "-z", "11", "-b", "0,0,32,16", "-o",
            &out_arg,
        ]))
        .run()
        .expect("export succeeds");
        assert_eq!(read_png(&out).expect("png decoded"), &plane + 50.0);

        let missing = parse(&["stackalign", "export", "-s", &store_arg, "-l", "nope", "-z", "11", "-b", "0,0,32,16", "-o", &out_arg]);
        assert!(App::new(missing).run().is_err());
    }

    // Tests a dry run plans against an imported store without writing outputs
    // Verified by creating output layers before the dry run check
    #[test]
    fn test_align_dry_run() {
        let dir = tempfile::tempdir().expect("temp dir");
        let pngs = dir.path().join("pngs");
        let plane = Array2::from_elem((64, 64), 128.0_f32);
        for name in ["a.png", "b.png", "c.png", "d.png"] {
            write_png(&pngs.join(name), &plane.view()).expect("png written");
        }
        let store = dir.path().join("store");
        let store_arg = store.to_string_lossy().to_string();
        let pngs_arg = pngs.to_string_lossy().to_string();
        App::new(parse(&["stackalign", "import", "-q", "-s", &store_arg, "-d", &pngs_arg, "--chunk", "32"]))
            .run()
            .expect("import succeeds");

        let config = dir.path().join("run.json");
        std::fs::write(
            &config,
            r#"{"bbox": {"min": [0, 0], "max": [64, 64]}, "max_mip": 5, "z_start": 0, "z_stop": 4,
                "block_size": 2, "tgt_radius": 1, "pad": 16, "chunk_size": [32, 32], "storage_chunk": [32, 32]}"#,
        )
        .expect("config written");
        let config_arg = config.to_string_lossy().to_string();

        App::new(parse(&["stackalign", "align", "-q", "-s", &store_arg, "-c", &config_arg, "--dry-run"]))
            .run()
            .expect("dry run succeeds");
        assert!(!store.join("dst").exists(), "Dry runs write nothing");

        let unknown_layer = dir.path().join("other.json");
        std::fs::write(
            &unknown_layer,
            r#"{"src_path": "missing", "bbox": {"min": [0, 0], "max": [64, 64]}, "max_mip": 5, "z_stop": 4}"#,
        )
        .expect("config written");
        let unknown_arg = unknown_layer.to_string_lossy().to_string();
        assert!(App::new(parse(&["stackalign", "align", "-q", "-s", &store_arg, "-c", &unknown_arg])).run().is_err());
    }
}
