use brewlink::config::ServiceConfig;
use brewlink::service::Service;

fn main() {
    let config = ServiceConfig::from_args();

    let default_level = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    log::info!("starting service '{}'", config.name);

    match Service::build(config) {
        Ok(service) => {
            let reason = service.run();
            std::process::exit(reason.code());
        }
        Err(err) => {
            log::error!("could not start service: {err}");
            std::process::exit(1);
        }
    }
}
