//! Plotly figures computed from the history buffer.
//!
//! The x axis of every chart is the sample's position in the buffer, so the
//! same index refers to a newer sample once older ones are evicted.

use pimon_proto::MetricSample;
use serde::Serialize;

const PAPER_COLOR: &str = "#111111";
const PLOT_COLOR: &str = "#1e1e1e";
const FONT_COLOR: &str = "#f2f2f2";

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub cpu: Chart,
    pub memory: Chart,
    pub disk: Chart,
    pub network: Chart,
    pub malicious_activity: Chart,
}

#[derive(Debug, Clone, Serialize)]
pub struct Chart {
    pub data: Vec<Trace>,
    pub layout: Layout,
}

impl Chart {
    fn empty(title: &str) -> Self {
        let mut layout = Layout::new(title, "", "");
        layout.annotations.push(Annotation::centered("No data yet"));
        Chart {
            data: Vec::new(),
            layout,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trace {
    Scatter {
        x: Vec<usize>,
        y: Vec<f64>,
        mode: &'static str,
        name: &'static str,
        line: Color,
    },
    Bar {
        x: Vec<&'static str>,
        y: Vec<u8>,
        marker: Color,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Color {
    pub color: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Layout {
    pub title: Text,
    pub xaxis: Axis,
    pub yaxis: Axis,
    pub paper_bgcolor: &'static str,
    pub plot_bgcolor: &'static str,
    pub font: Color,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

impl Layout {
    fn new(title: &str, x_title: &str, y_title: &str) -> Self {
        Layout {
            title: Text::from(title),
            xaxis: Axis {
                title: Text::from(x_title),
            },
            yaxis: Axis {
                title: Text::from(y_title),
            },
            paper_bgcolor: PAPER_COLOR,
            plot_bgcolor: PLOT_COLOR,
            font: Color { color: FONT_COLOR },
            annotations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Text {
    pub text: String,
}

impl From<&str> for Text {
    fn from(text: &str) -> Self {
        Text {
            text: text.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Axis {
    pub title: Text,
}

#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub text: String,
    pub showarrow: bool,
    pub xref: &'static str,
    pub yref: &'static str,
    pub x: f64,
    pub y: f64,
}

impl Annotation {
    fn centered(text: &str) -> Self {
        Annotation {
            text: text.to_owned(),
            showarrow: false,
            xref: "paper",
            yref: "paper",
            x: 0.5,
            y: 0.5,
        }
    }
}

const CPU_TITLE: &str = "CPU Usage";
const MEMORY_TITLE: &str = "Memory Usage";
const DISK_TITLE: &str = "Disk Usage";
const NETWORK_TITLE: &str = "Network Traffic";
const MALICIOUS_TITLE: &str = "Malicious Activity Indicator";

/// `1` when the CPU usage is strictly above `threshold`, else `0`.
///
/// A placeholder signal, not an intrusion detector.
pub fn malicious_activity_level(cpu_usage: f64, threshold: f64) -> u8 {
    u8::from(cpu_usage > threshold)
}

fn scatter(
    x: &[usize],
    y: Vec<f64>,
    mode: &'static str,
    name: &'static str,
    color: &'static str,
) -> Trace {
    Trace::Scatter {
        x: x.to_vec(),
        y,
        mode,
        name,
        line: Color { color },
    }
}

pub fn render_dashboard(samples: &[MetricSample], malicious_cpu_threshold: f64) -> Dashboard {
    let Some(last) = samples.last() else {
        return Dashboard {
            cpu: Chart::empty(CPU_TITLE),
            memory: Chart::empty(MEMORY_TITLE),
            disk: Chart::empty(DISK_TITLE),
            network: Chart::empty(NETWORK_TITLE),
            malicious_activity: Chart::empty(MALICIOUS_TITLE),
        };
    };

    let x: Vec<usize> = (0..samples.len()).collect();
    let series = |f: fn(&MetricSample) -> f64| samples.iter().map(f).collect::<Vec<_>>();

    let level = malicious_activity_level(last.cpu_usage, malicious_cpu_threshold);

    Dashboard {
        cpu: Chart {
            data: vec![scatter(
                &x,
                series(|s| s.cpu_usage),
                "lines+markers",
                CPU_TITLE,
                "red",
            )],
            layout: Layout::new(CPU_TITLE, "Time", "CPU %"),
        },
        memory: Chart {
            data: vec![scatter(
                &x,
                series(|s| s.memory_usage),
                "lines+markers",
                MEMORY_TITLE,
                "blue",
            )],
            layout: Layout::new(MEMORY_TITLE, "Time", "Memory %"),
        },
        disk: Chart {
            data: vec![scatter(
                &x,
                series(|s| s.disk_usage),
                "lines+markers",
                DISK_TITLE,
                "green",
            )],
            layout: Layout::new(DISK_TITLE, "Time", "Disk %"),
        },
        network: Chart {
            data: vec![
                scatter(
                    &x,
                    series(|s| s.network_sent),
                    "lines",
                    "Bytes Sent",
                    "purple",
                ),
                scatter(
                    &x,
                    series(|s| s.network_received),
                    "lines",
                    "Bytes Received",
                    "orange",
                ),
            ],
            layout: Layout::new(NETWORK_TITLE, "Time", "Bytes"),
        },
        malicious_activity: Chart {
            data: vec![Trace::Bar {
                x: vec!["Malicious Activity"],
                y: vec![level],
                marker: Color {
                    color: if level == 1 { "red" } else { "green" },
                },
            }],
            layout: Layout::new(MALICIOUS_TITLE, "", "Risk Level"),
        },
    }
}
