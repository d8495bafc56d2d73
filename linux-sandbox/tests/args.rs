use tabulon_linux_sandbox::Args;

#[test]
fn parses_exactly_six_positional_arguments() {
    let argv = vec![
        "/data".to_string(),
        "/tmp/scratch".to_string(),
        "/usr/bin/tabulon-runner".to_string(),
        "536870912".to_string(),
        "30".to_string(),
        "64".to_string(),
    ];
    let args = Args::parse(&argv).unwrap();
    assert_eq!(args.datasets_dir, "/data");
    assert_eq!(args.scratch_dir, "/tmp/scratch");
    assert_eq!(args.runner_path, "/usr/bin/tabulon-runner");
    assert_eq!(args.memory_limit_bytes, 536_870_912);
    assert_eq!(args.cpu_limit_seconds, 30);
    assert_eq!(args.max_processes, 64);
}

#[test]
fn rejects_wrong_argument_count() {
    assert!(Args::parse(&["/data".to_string()]).is_err());
    assert!(Args::parse(&[]).is_err());
}

#[test]
fn rejects_non_numeric_resource_limits() {
    let argv = vec![
        "/data".to_string(),
        "/tmp/scratch".to_string(),
        "/usr/bin/tabulon-runner".to_string(),
        "not-a-number".to_string(),
        "30".to_string(),
        "64".to_string(),
    ];
    assert!(Args::parse(&argv).is_err());
}
