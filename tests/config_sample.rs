//! Full-document configuration test
//!
//! Parses a configuration that enables every daemon, verifies the typed
//! view, and builds the supervisor from it. Ports in the document are never
//! bound here; construction and validation must succeed without touching
//! the network.

use std::sync::Arc;

use toolhost::config::parse_config;
use toolhost::logbuf::LogRing;
use toolhost::supervisor::Supervisor;

const SAMPLE_CONFIG: &str = r#"
{
  "DNSDaemon": {
    "Address": "127.0.0.1",
    "AllowQueryIPPrefixes": [
      "192"
    ],
    "PerIPLimit": 5,
    "TCPPort": 45115,
    "UDPPort": 23518
  },
  "Features": {
    "Shell": {
      "InterpreterPath": "/bin/sh"
    }
  },
  "HTTPDaemon": {
    "Address": "127.0.0.1",
    "PerIPLimit": 10,
    "Port": 23486,
    "ServeDirectories": {}
  },
  "HTTPFilters": {
    "LintText": {
      "CompressSpaces": true,
      "CompressToSingleLine": true,
      "KeepVisible7BitCharOnly": true,
      "MaxLength": 35,
      "TrimSpaces": true
    },
    "NotifyViaEmail": {
      "Recipients": [
        "howard@localhost"
      ]
    },
    "PINAndShortcuts": {
      "PIN": "verysecret",
      "Shortcuts": {
        "httpshortcut": ".secho httpshortcut"
      }
    },
    "TranslateSequences": {
      "Sequences": [
        [
          "alpha",
          "beta"
        ]
      ]
    }
  },
  "HTTPHandlers": {
    "CommandFormEndpoint": "/cmd_form",
    "InformationEndpoint": "/info"
  },
  "MailClient": {
    "MTAHost": "127.0.0.1",
    "MTAPort": 25,
    "MailFrom": "howard@localhost"
  },
  "MailCommandRunner": {
    "CommandTimeoutSec": 10
  },
  "MailDaemon": {
    "Address": "127.0.0.1",
    "ForwardTo": [
      "howard@localhost",
      "root@localhost"
    ],
    "MyDomains": [
      "example.com",
      "howard.name"
    ],
    "PerIPLimit": 5,
    "Port": 18573
  },
  "MailFilters": {
    "LintText": {
      "CompressToSingleLine": true,
      "MaxLength": 70,
      "TrimSpaces": true
    },
    "PINAndShortcuts": {
      "PIN": "verysecret",
      "Shortcuts": {
        "mailshortcut": ".secho mailshortcut"
      }
    }
  },
  "Maintenance": {
    "IntervalSec": 3600,
    "Recipients": [
      "howard@localhost"
    ],
    "TCPPorts": [
      9114
    ]
  },
  "PlainSocketDaemon": {
    "Address": "127.0.0.1",
    "PerIPLimit": 5,
    "TCPPort": 17011,
    "UDPPort": 43915
  },
  "PlainSocketFilters": {
    "LintText": {
      "MaxLength": 120,
      "TrimSpaces": true
    },
    "PINAndShortcuts": {
      "PIN": "verysecret",
      "Shortcuts": {
        "plainsocketshortcut": ".secho plainsockethortcut"
      }
    }
  },
  "SockDaemon": {
    "Address": "127.0.0.1",
    "Password": "1234567",
    "PerIPLimit": 10,
    "TCPPort": 6891,
    "UDPPort": 9122
  },
  "SupervisorNotificationRecipients": [
    "howard@localhost"
  ],
  "TelegramBot": {
    "AuthorizationToken": "intentionally-bad-token",
    "PerUserLimit": 2
  },
  "TelegramFilters": {
    "LintText": {
      "CompressToSingleLine": true,
      "MaxLength": 120,
      "TrimSpaces": true
    },
    "PINAndShortcuts": {
      "PIN": "verysecret",
      "Shortcuts": {
        "telegramshortcut": ".secho telegramshortcut"
      }
    }
  }
}"#;

#[test]
fn test_sample_config_parses_and_validates() {
    let config = parse_config(SAMPLE_CONFIG).expect("sample config must parse");

    let dns = config.dns_daemon.as_ref().expect("DNS section");
    assert_eq!(dns.udp_port, 23518);
    assert_eq!(dns.tcp_port, 45115);
    assert_eq!(dns.per_ip_limit, 5);
    assert_eq!(dns.allow_query_ip_prefixes, vec!["192".to_string()]);

    let http = config.http_daemon.as_ref().expect("HTTP section");
    assert_eq!(http.port, 23486);

    let mail = config.mail_daemon.as_ref().expect("mail section");
    assert_eq!(mail.my_domains.len(), 2);
    assert_eq!(mail.forward_to.len(), 2);

    let maintenance = config.maintenance.as_ref().expect("maintenance section");
    assert_eq!(maintenance.interval_sec, 3600);
    assert_eq!(maintenance.tcp_ports, vec![9114]);

    assert_eq!(
        config
            .http_filters
            .pin_and_shortcuts
            .as_ref()
            .expect("HTTP PIN stage")
            .pin,
        "verysecret"
    );
    assert_eq!(
        config.http_filters.lint_text.as_ref().expect("lint").max_length,
        35
    );
    assert_eq!(config.mail_command_runner.command_timeout_sec, Some(10));
    assert!(config.mail_client.is_configured());
}

#[test]
fn test_supervisor_builds_every_daemon_from_sample() {
    let config = parse_config(SAMPLE_CONFIG).expect("sample config must parse");
    let supervisor =
        Supervisor::from_config(&config, Arc::new(LogRing::new())).expect("supervisor must build");
    assert_eq!(
        supervisor.daemon_names(),
        vec![
            "dnsd",
            "httpd",
            "smtpd",
            "plainsock",
            "sockd",
            "telegram",
            "maintenance"
        ]
    );
}

#[test]
fn test_maintenance_interval_below_floor_refused() {
    let config = SAMPLE_CONFIG.replace(r#""IntervalSec": 3600"#, r#""IntervalSec": 600"#);
    let parsed = parse_config(&config).expect("document still parses");
    assert!(
        Supervisor::from_config(&parsed, Arc::new(LogRing::new())).is_err(),
        "interval below the floor must refuse startup"
    );
}
