fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = tabulon_linux_sandbox::Args::parse(&argv)?;
    tabulon_linux_sandbox::run_main(args)
}
