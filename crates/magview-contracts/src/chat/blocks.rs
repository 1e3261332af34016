use serde_json::{json, Value};

use crate::settings::{AppSettings, ColoringMode};

pub const SETTINGS_BUTTON_ACTION_ID: &str = "open_settings";
pub const DEMO_BUTTON_ACTION_ID: &str = "demo_upload";
pub const SETTINGS_VIEW_CALLBACK_ID: &str = "settings_view";
pub const COLORING_ACTION_ID: &str = "coloring_select";
pub const ALT_TEXT_ACTION_ID: &str = "alt_text_select";
pub const RESIZE_ACTION_ID: &str = "resize_select";

/// Resize choices offered in the settings modal. The store itself accepts
/// any positive percent; this list only bounds the modal.
pub const RESIZE_CHOICES: [&str; 4] = ["100%", "125%", "150%", "200%"];

pub fn home_view() -> Value {
    json!({
        "type": "home",
        "callback_id": "home_view",
        "blocks": [
            {
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": ":frame_with_picture:  MAGVIEW",
                    "emoji": true,
                },
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": "Make images color-blindness friendly with recoloring and automatically generated image alt text. A convenient way to make visuals more accessible for your teammates.",
                },
            },
            {"type": "divider"},
            {
                "type": "section",
                "text": {"type": "mrkdwn", "text": "🔢 *HOW TO USE*"},
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": "In any channel, *react with the 🔎 emoji* to a message's image attachment. This app will then respond in thread with the recolored image and generated alt text.",
                },
            },
            {
                "type": "section",
                "text": {"type": "mrkdwn", "text": "⚙️  *SETTINGS*"},
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": "Configure the app to your vision. For example, you can choose to have this app generate red/green or blue/yellow color-accessible images below.",
                },
            },
            {
                "type": "actions",
                "elements": [{
                    "type": "button",
                    "text": {"type": "plain_text", "text": "Edit App Settings", "emoji": true},
                    "value": "configure",
                    "action_id": SETTINGS_BUTTON_ACTION_ID,
                }],
            },
            {"type": "divider"},
            {
                "type": "section",
                "text": {"type": "mrkdwn", "text": "🙋‍♀️ *TRY IT IN ACTION*"},
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": "You will be sent a direct message from this bot so you can test out the functionality yourself!",
                },
            },
            {
                "type": "actions",
                "elements": [{
                    "type": "button",
                    "text": {"type": "plain_text", "text": "Let's Test!", "emoji": true},
                    "value": "tutorial",
                    "action_id": DEMO_BUTTON_ACTION_ID,
                }],
            },
        ],
    })
}

pub fn settings_modal(current: &AppSettings) -> Value {
    let coloring_options: Vec<Value> = ColoringMode::all()
        .iter()
        .map(|mode| select_option(mode.as_str()))
        .collect();
    let alt_text_options: Vec<Value> = ["Enabled", "Disabled"]
        .iter()
        .map(|label| select_option(label))
        .collect();
    let resize_options: Vec<Value> = RESIZE_CHOICES
        .iter()
        .map(|label| select_option(label))
        .collect();

    json!({
        "type": "modal",
        "callback_id": SETTINGS_VIEW_CALLBACK_ID,
        "title": {"type": "plain_text", "text": "Settings"},
        "submit": {"type": "plain_text", "text": "Submit"},
        "close": {"type": "plain_text", "text": "Cancel"},
        "blocks": [
            {"type": "divider"},
            {
                "type": "input",
                "label": {"type": "plain_text", "text": "Image Coloring", "emoji": true},
                "element": {
                    "type": "static_select",
                    "action_id": COLORING_ACTION_ID,
                    "placeholder": {
                        "type": "plain_text",
                        "text": current.coloring.as_str(),
                        "emoji": true,
                    },
                    "options": coloring_options,
                },
            },
            {
                "type": "input",
                "label": {"type": "plain_text", "text": "Alt Text Generation", "emoji": true},
                "element": {
                    "type": "static_select",
                    "action_id": ALT_TEXT_ACTION_ID,
                    "placeholder": {
                        "type": "plain_text",
                        "text": current.alt_text_label(),
                        "emoji": true,
                    },
                    "options": alt_text_options,
                },
            },
            {
                "type": "input",
                "label": {"type": "plain_text", "text": "Image Resizing", "emoji": true},
                "element": {
                    "type": "static_select",
                    "action_id": RESIZE_ACTION_ID,
                    "placeholder": {
                        "type": "plain_text",
                        "text": current.resize_label(),
                        "emoji": true,
                    },
                    "options": resize_options,
                },
            },
        ],
    })
}

fn select_option(label: &str) -> Value {
    json!({
        "text": {"type": "plain_text", "text": label, "emoji": true},
        "value": label,
    })
}
