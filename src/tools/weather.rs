use chrono::Local;
use serde_json::{Value, json};

use crate::tools::{ToolOutput, ToolSpec};

fn location_schema(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "location": {"type": "string", "description": description}
        },
        "required": ["location"],
        "additionalProperties": false
    })
}

fn location(args: &Value) -> String {
    args.get("location")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn weather_tools() -> Vec<ToolSpec> {
    vec![get_weather_tool(), get_max_temperature_tool()]
}

pub fn get_weather_tool() -> ToolSpec {
    ToolSpec::new("get_weather", "Get the weather for a given location.")
        .with_schema(location_schema("The location to get the weather for."))
        .expect("valid schema")
        .with_handler(|args, _deps| {
            let location = location(&args);
            async move {
                Ok(ToolOutput::Text(format!(
                    "The weather in {location} is cloudy with a high of 15°C."
                )))
            }
        })
}

pub fn get_max_temperature_tool() -> ToolSpec {
    ToolSpec::new(
        "get_max_temperature",
        "Get the maximum temperature expected for the day in a given location.",
    )
    .with_schema(location_schema(
        "The location to get the maximum temperature for.",
    ))
    .expect("valid schema")
    .with_handler(|args, _deps| {
        let location = location(&args);
        async move {
            Ok(ToolOutput::Text(format!(
                "The maximum temperature expected in {location} today is 22°C."
            )))
        }
    })
}

pub fn time_tool() -> ToolSpec {
    ToolSpec::new("get_time", "Return the current time in HH:MM:SS format.")
        .with_handler(|_args, _deps| async move {
            Ok(ToolOutput::Text(Local::now().format("%H:%M:%S").to_string()))
        })
}
