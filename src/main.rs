#![allow(clippy::upper_case_acronyms)]

use std::sync::Arc;

use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use beng_proxy::config::{Config, Tls};
use beng_proxy::control::ControlService;
use beng_proxy::logging::Logger;
use beng_proxy::pipeline::{PipelineConfig, RequestPipeline};
use beng_proxy::resource::loader::ResourceLoader;
use beng_proxy::service::http::HttpService;

fn main() {
    let opt = Opt::parse_args();
    let config = Config::load_yaml_with_opt_override(&opt).expect("failed to load configuration");

    let access_log = Logger::new(config.log.clone());
    access_log.init_env_logger();
    let access_log_handle = access_log.handle();

    log::info!("building resource loader and translation pipeline...");
    let loader = Arc::new(ResourceLoader::new(config.stock.limit, config.stock.max_idle));
    let pipeline = RequestPipeline::new(
        PipelineConfig {
            translation_socket_path: config.translation_server.socket_path.clone(),
            local_identity: "beng-proxy".to_string(),
            translation_pool_size: config.translation_server.pool_size,
        },
        loader,
    );
    let translation_cache = pipeline.translation_cache();

    let http_service = HttpService::new(pipeline, access_log_handle);

    let mut beng_server = Server::new_with_opt_and_conf(Some(opt), config.pingora.clone());
    beng_server.bootstrap();

    log::info!("adding services...");
    let mut http_proxy =
        http_proxy_service_with_name(&beng_server.configuration, http_service, "beng-proxy");

    for listener in &config.listeners {
        match &listener.tls {
            Some(Tls { cert_path, key_path }) => {
                let mut settings = TlsSettings::intermediate(cert_path, key_path)
                    .expect("adding TLS listener shouldn't fail");
                if listener.offer_h2 {
                    settings.enable_h2();
                }
                http_proxy.add_tls_with_settings(&listener.address.to_string(), None, settings);
            }
            None => {
                http_proxy.add_tcp(&listener.address.to_string());
            }
        }
    }

    beng_server.add_service(http_proxy);
    beng_server.add_service(access_log);

    if let Some(control) = &config.control {
        log::info!("starting control-plane listener on {}", control.address);
        beng_server.add_service(ControlService::new(control.address.to_string(), translation_cache));
    }

    log::info!("starting server...");
    beng_server.run_forever();
}
