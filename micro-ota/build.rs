fn main() {
    // re-emit the esp-idf cfg and link flags for crates downstream of us
    if std::env::var("TARGET").unwrap_or_default().ends_with("-espidf") {
        let cfg_args = embuild::build::CfgArgs::try_from_env("ESP_IDF_SVC").unwrap();
        cfg_args.output();
        cfg_args.propagate();

        let link_args = embuild::build::LinkArgs::try_from_env("ESP_IDF_SVC").unwrap();
        link_args.output();
        link_args.propagate();
    }
}
