//! Stub rendering for generated project files.
//!
//! Stubs carry `{{SLOT}}` placeholders drawn from a closed [`Slot`] schema.
//! Rendering rejects unknown placeholders and slots without a value, so no
//! literal `{{...}}` ever reaches a generated file.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::models::{AddOn, PortMap, ProjectRecord, ServiceKind, Template, TemplateInfo};
use super::models::{default_node_version, default_php_version};
use crate::config::PortBaselines;
use crate::errors::TemplateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    ProjectName,
    AppPort,
    AppUrl,
    DbPort,
    DbName,
    DbUser,
    DbPassword,
    RedisPort,
    VitePort,
    PhpmyadminPort,
    MailhogPort,
    PhpVersion,
    NodeVersion,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectName => "PROJECT_NAME",
            Self::AppPort => "APP_PORT",
            Self::AppUrl => "APP_URL",
            Self::DbPort => "DB_PORT",
            Self::DbName => "DB_NAME",
            Self::DbUser => "DB_USER",
            Self::DbPassword => "DB_PASSWORD",
            Self::RedisPort => "REDIS_PORT",
            Self::VitePort => "VITE_PORT",
            Self::PhpmyadminPort => "PHPMYADMIN_PORT",
            Self::MailhogPort => "MAILHOG_PORT",
            Self::PhpVersion => "PHP_VERSION",
            Self::NodeVersion => "NODE_VERSION",
        }
    }

    fn for_port(service: ServiceKind) -> Slot {
        match service {
            ServiceKind::App => Self::AppPort,
            ServiceKind::Db => Self::DbPort,
            ServiceKind::Redis => Self::RedisPort,
            ServiceKind::Vite => Self::VitePort,
            ServiceKind::Phpmyadmin => Self::PhpmyadminPort,
            ServiceKind::Mailhog => Self::MailhogPort,
        }
    }
}

impl FromStr for Slot {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROJECT_NAME" => Ok(Self::ProjectName),
            "APP_PORT" => Ok(Self::AppPort),
            "APP_URL" => Ok(Self::AppUrl),
            "DB_PORT" => Ok(Self::DbPort),
            "DB_NAME" => Ok(Self::DbName),
            "DB_USER" => Ok(Self::DbUser),
            "DB_PASSWORD" => Ok(Self::DbPassword),
            "REDIS_PORT" => Ok(Self::RedisPort),
            "VITE_PORT" => Ok(Self::VitePort),
            "PHPMYADMIN_PORT" => Ok(Self::PhpmyadminPort),
            "MAILHOG_PORT" => Ok(Self::MailhogPort),
            "PHP_VERSION" => Ok(Self::PhpVersion),
            "NODE_VERSION" => Ok(Self::NodeVersion),
            other => Err(TemplateError::UnknownSlot(other.to_string())),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values for a render call.
#[derive(Debug, Clone, Default)]
pub struct SlotValues(BTreeMap<Slot, String>);

impl SlotValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, slot: Slot, value: impl Into<String>) -> &mut Self {
        self.0.insert(slot, value.into());
        self
    }

    pub fn get(&self, slot: Slot) -> Option<&str> {
        self.0.get(&slot).map(String::as_str)
    }

    pub fn for_project(record: &ProjectRecord) -> Self {
        let mut values = Self::new();
        values
            .set(Slot::ProjectName, record.name.clone())
            .set(Slot::DbName, record.config.database.name.clone())
            .set(Slot::DbUser, record.config.database.user.clone())
            .set(Slot::DbPassword, record.config.database.password.clone())
            .set(Slot::PhpVersion, record.config.php_version.clone())
            .set(Slot::NodeVersion, record.config.node_version.clone());
        for (service, port) in &record.ports {
            values.set(Slot::for_port(*service), port.to_string());
        }
        if let Some(url) = record.app_url() {
            values.set(Slot::AppUrl, url);
        }
        values
    }
}

/// Replace every `{{SLOT}}` in `stub`.
pub fn render(stub: &str, values: &SlotValues) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(stub.len());
    let mut rest = stub;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + start))?;
        let name = after_open[..end].trim();
        let slot = Slot::from_str(name)?;
        let value = values
            .get(slot)
            .ok_or_else(|| TemplateError::MissingValue(name.to_string()))?;
        out.push_str(value);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

/// A file produced for a project, relative to its directory.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedFile {
    pub path: &'static str,
    pub content: String,
}

/// Render `docker-compose.yml`, `Dockerfile`, `.env` and `Makefile`.
pub fn project_files(record: &ProjectRecord) -> Result<Vec<GeneratedFile>, TemplateError> {
    let values = SlotValues::for_project(record);
    let (dockerfile, env, makefile) = match record.template {
        Template::Laravel => (LARAVEL_DOCKERFILE, LARAVEL_ENV, LARAVEL_MAKEFILE),
        Template::Nodejs => (NODE_DOCKERFILE, NODE_ENV, NODE_MAKEFILE),
    };

    let mut env_stub = env.to_string();
    if record.has_addon(AddOn::Redis) {
        env_stub.push_str(ENV_REDIS);
    }
    if record.has_addon(AddOn::Mailhog) {
        env_stub.push_str(ENV_MAILHOG);
    }

    Ok(vec![
        GeneratedFile {
            path: "docker-compose.yml",
            content: compose_file(record, &values)?,
        },
        GeneratedFile {
            path: "Dockerfile",
            content: render(dockerfile, &values)?,
        },
        GeneratedFile {
            path: ".env",
            content: render(&env_stub, &values)?,
        },
        GeneratedFile {
            path: "Makefile",
            content: render(makefile, &values)?,
        },
    ])
}

/// Assemble the compose file from one fragment per allocated service.
pub fn compose_file(record: &ProjectRecord, values: &SlotValues) -> Result<String, TemplateError> {
    let mut stub = String::from(COMPOSE_HEADER);
    for service in record.ports.keys() {
        let fragment = match (record.template, service) {
            (Template::Laravel, ServiceKind::App) => COMPOSE_LARAVEL_APP,
            (Template::Nodejs, ServiceKind::App) => COMPOSE_NODE_APP,
            (_, ServiceKind::Db) => COMPOSE_DB,
            (_, ServiceKind::Vite) => COMPOSE_VITE,
            (_, ServiceKind::Redis) => COMPOSE_REDIS,
            (_, ServiceKind::Phpmyadmin) => COMPOSE_PHPMYADMIN,
            (_, ServiceKind::Mailhog) => COMPOSE_MAILHOG,
        };
        stub.push_str(fragment);
    }
    if record.ports.contains_key(&ServiceKind::Db) {
        stub.push_str(COMPOSE_VOLUMES);
    }
    render(&stub, values)
}

/// Template list served by `GET /api/templates`.
pub fn catalog(baselines: &PortBaselines) -> Vec<TemplateInfo> {
    Template::all()
        .into_iter()
        .map(|template| {
            let node = template == Template::Nodejs;
            let mut port_baselines = PortMap::new();
            for service in template.base_services() {
                port_baselines.insert(*service, baselines.baseline(*service, node));
            }
            for addon in template.supported_addons() {
                let service = addon.service();
                port_baselines.insert(service, baselines.baseline(service, node));
            }
            TemplateInfo {
                name: template,
                description: match template {
                    Template::Laravel => "Laravel on PHP with MySQL and Vite",
                    Template::Nodejs => "Node.js application",
                },
                base_services: template.base_services().to_vec(),
                addons: template.supported_addons().to_vec(),
                default_php_version: (!node).then(default_php_version),
                default_node_version: default_node_version(),
                port_baselines,
            }
        })
        .collect()
}

const COMPOSE_HEADER: &str = "name: {{PROJECT_NAME}}\n\nservices:\n";

const COMPOSE_LARAVEL_APP: &str = r#"  app:
    build: .
    container_name: {{PROJECT_NAME}}-app
    ports:
      - "{{APP_PORT}}:8000"
    volumes:
      - ./:/var/www/html
    env_file:
      - .env
    depends_on:
      - db
"#;

const COMPOSE_NODE_APP: &str = r#"  app:
    build: .
    container_name: {{PROJECT_NAME}}-app
    ports:
      - "{{APP_PORT}}:3000"
    volumes:
      - ./:/usr/src/app
      - /usr/src/app/node_modules
    env_file:
      - .env
"#;

const COMPOSE_DB: &str = r#"  db:
    image: mysql:8.0
    container_name: {{PROJECT_NAME}}-db
    ports:
      - "{{DB_PORT}}:3306"
    environment:
      MYSQL_DATABASE: {{DB_NAME}}
      MYSQL_USER: {{DB_USER}}
      MYSQL_PASSWORD: {{DB_PASSWORD}}
      MYSQL_ROOT_PASSWORD: {{DB_PASSWORD}}
    volumes:
      - db-data:/var/lib/mysql
"#;

const COMPOSE_VITE: &str = r#"  vite:
    image: node:{{NODE_VERSION}}-alpine
    container_name: {{PROJECT_NAME}}-vite
    working_dir: /var/www/html
    command: sh -c "npm install && npm run dev -- --host 0.0.0.0 --port 5173"
    ports:
      - "{{VITE_PORT}}:5173"
    volumes:
      - ./:/var/www/html
"#;

const COMPOSE_REDIS: &str = r#"  redis:
    image: redis:7-alpine
    container_name: {{PROJECT_NAME}}-redis
    ports:
      - "{{REDIS_PORT}}:6379"
"#;

const COMPOSE_PHPMYADMIN: &str = r#"  phpmyadmin:
    image: phpmyadmin:latest
    container_name: {{PROJECT_NAME}}-phpmyadmin
    ports:
      - "{{PHPMYADMIN_PORT}}:80"
    environment:
      PMA_HOST: db
    depends_on:
      - db
"#;

const COMPOSE_MAILHOG: &str = r#"  mailhog:
    image: mailhog/mailhog:latest
    container_name: {{PROJECT_NAME}}-mailhog
    ports:
      - "{{MAILHOG_PORT}}:8025"
"#;

const COMPOSE_VOLUMES: &str = "\nvolumes:\n  db-data:\n";

const LARAVEL_DOCKERFILE: &str = r#"FROM php:{{PHP_VERSION}}-cli

RUN apt-get update && apt-get install -y git unzip libzip-dev libpng-dev libonig-dev \
    && docker-php-ext-install pdo_mysql mbstring zip gd \
    && rm -rf /var/lib/apt/lists/*

COPY --from=composer:2 /usr/bin/composer /usr/bin/composer

WORKDIR /var/www/html
EXPOSE 8000
CMD ["php", "artisan", "serve", "--host=0.0.0.0", "--port=8000"]
"#;

const NODE_DOCKERFILE: &str = r#"FROM node:{{NODE_VERSION}}-alpine

WORKDIR /usr/src/app
COPY package*.json ./
RUN npm install
COPY . .

EXPOSE 3000
CMD ["npm", "run", "dev"]
"#;

const LARAVEL_ENV: &str = "APP_NAME={{PROJECT_NAME}}
APP_ENV=local
APP_DEBUG=true
APP_URL={{APP_URL}}

DB_CONNECTION=mysql
DB_HOST=db
DB_PORT=3306
DB_DATABASE={{DB_NAME}}
DB_USERNAME={{DB_USER}}
DB_PASSWORD={{DB_PASSWORD}}
";

const NODE_ENV: &str = "NODE_ENV=development
PORT=3000
APP_URL={{APP_URL}}
";

const ENV_REDIS: &str = "
REDIS_HOST=redis
REDIS_PORT=6379
";

const ENV_MAILHOG: &str = "
MAIL_MAILER=smtp
MAIL_HOST=mailhog
MAIL_PORT=1025
";

const LARAVEL_MAKEFILE: &str = "PROJECT := {{PROJECT_NAME}}

up:
\tdocker compose up -d

down:
\tdocker compose down

logs:
\tdocker compose logs -f

shell:
\tdocker compose exec app bash

migrate:
\tdocker compose exec app php artisan migrate

.PHONY: up down logs shell migrate
";

const NODE_MAKEFILE: &str = "PROJECT := {{PROJECT_NAME}}

up:
\tdocker compose up -d

down:
\tdocker compose down

logs:
\tdocker compose logs -f

shell:
\tdocker compose exec app sh

.PHONY: up down logs shell
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::models::*;
    use chrono::Utc;
    use std::path::PathBuf;

    fn project(template: Template, addons: Vec<AddOn>) -> ProjectRecord {
        let baselines = PortBaselines::default();
        let probe = crate::dashboard::ports::RegistryOnly;
        let allocator = crate::dashboard::ports::PortAllocator::new(&baselines, &probe);
        let ports = allocator
            .allocate(template, &addons, &Default::default(), &Default::default())
            .unwrap();
        let now = Utc::now();
        ProjectRecord {
            id: "id".into(),
            name: "demo".into(),
            template,
            path: PathBuf::from("/tmp/demo"),
            ports,
            status: ProjectStatus::Creating,
            config: ProjectConfig {
                services: addons,
                php_version: default_php_version(),
                node_version: default_node_version(),
                database: DatabaseConfig::for_project("demo"),
            },
            created_at: now,
            last_activity: now,
            error: None,
        }
    }

    fn compose_yaml(record: &ProjectRecord) -> serde_yaml::Value {
        let text = compose_file(record, &SlotValues::for_project(record)).unwrap();
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn test_render_replaces_known_slots() {
        let mut values = SlotValues::new();
        values.set(Slot::ProjectName, "demo").set(Slot::AppPort, "8000");
        let out = render("name={{PROJECT_NAME}} port={{ APP_PORT }}", &values).unwrap();
        assert_eq!(out, "name=demo port=8000");
    }

    #[test]
    fn test_render_rejects_unknown_slot() {
        let values = SlotValues::new();
        let err = render("{{NOT_A_SLOT}}", &values).unwrap_err();
        assert_eq!(err, TemplateError::UnknownSlot("NOT_A_SLOT".into()));
    }

    #[test]
    fn test_render_rejects_missing_value() {
        let mut values = SlotValues::new();
        values.set(Slot::ProjectName, "demo");
        let err = render("{{PROJECT_NAME}}:{{APP_PORT}}", &values).unwrap_err();
        assert_eq!(err, TemplateError::MissingValue("APP_PORT".into()));
    }

    #[test]
    fn test_render_rejects_unterminated() {
        let values = SlotValues::new();
        let err = render("abc {{PROJECT_NAME", &values).unwrap_err();
        assert_eq!(err, TemplateError::Unterminated(4));
    }

    #[test]
    fn test_render_leaves_plain_text_alone() {
        let values = SlotValues::new();
        assert_eq!(render("no slots { here }", &values).unwrap(), "no slots { here }");
    }

    #[test]
    fn test_compose_includes_redis_only_when_enabled() {
        let with = project(Template::Laravel, vec![AddOn::Redis]);
        let yaml = compose_yaml(&with);
        let services = yaml["services"].as_mapping().unwrap();
        assert!(services.contains_key("redis"));
        assert_eq!(yaml["services"]["redis"]["ports"][0], "6379:6379");

        let without = project(Template::Laravel, vec![]);
        let yaml = compose_yaml(&without);
        let services = yaml["services"].as_mapping().unwrap();
        assert!(!services.contains_key("redis"));
        assert!(services.contains_key("app"));
        assert!(services.contains_key("db"));
        assert!(services.contains_key("vite"));
    }

    #[test]
    fn test_nodejs_compose_has_no_database() {
        let record = project(Template::Nodejs, vec![AddOn::Mailhog]);
        let yaml = compose_yaml(&record);
        let services = yaml["services"].as_mapping().unwrap();
        assert!(!services.contains_key("db"));
        assert!(services.contains_key("mailhog"));
        assert_eq!(yaml["services"]["app"]["ports"][0], "3000:3000");
        assert!(yaml.get("volumes").is_none());
    }

    #[test]
    fn test_project_files_leave_no_placeholders() {
        for template in Template::all() {
            let record = project(template, template.supported_addons().to_vec());
            let files = project_files(&record).unwrap();
            assert_eq!(files.len(), 4);
            for file in files {
                assert!(
                    !file.content.contains("{{"),
                    "{} for {} still has a placeholder",
                    file.path,
                    template
                );
            }
        }
    }

    #[test]
    fn test_env_file_contents() {
        let record = project(Template::Laravel, vec![AddOn::Redis]);
        let files = project_files(&record).unwrap();
        let env = files.iter().find(|f| f.path == ".env").unwrap();
        assert!(env.content.contains("APP_URL=http://localhost:8000"));
        assert!(env.content.contains("DB_DATABASE=demo"));
        assert!(env.content.contains("REDIS_HOST=redis"));
        assert!(!env.content.contains("MAIL_HOST"));
    }

    #[test]
    fn test_makefile_uses_tabs() {
        let record = project(Template::Laravel, vec![]);
        let files = project_files(&record).unwrap();
        let makefile = files.iter().find(|f| f.path == "Makefile").unwrap();
        assert!(makefile.content.contains("up:\n\tdocker compose up -d"));
    }

    #[test]
    fn test_catalog_lists_both_templates() {
        let catalog = catalog(&PortBaselines::default());
        assert_eq!(catalog.len(), 2);
        let node = catalog.iter().find(|t| t.name == Template::Nodejs).unwrap();
        assert_eq!(node.port_baselines.get(&ServiceKind::App), Some(&3000));
        assert!(node.default_php_version.is_none());
    }
}
