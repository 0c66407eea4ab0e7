use chrono::Local;
use scenic_bridge::Endpoint;

pub fn get_server_instructions(endpoint: &Endpoint) -> String {
    let current_date_time = Local::now().to_string();
    let current_os = std::env::consts::OS;

    format!(
        "
You drive a running Scenic (Elixir) GUI application through a local command socket. Tools send keyboard and mouse input, describe what is on screen, capture screenshots and manage the application process.

**Recommended workflow**
1.  `start_app` with the absolute path of the Scenic project (runs `mix run --no-halt` there). Skip this if the app is already running.
2.  `connect_scenic` to attach to the app's command socket (currently {endpoint}). A \"waiting for connection\" result is normal while the app is still booting; retry after a few seconds.
3.  `inspect_viewport` to learn what is on screen before acting.
4.  `send_keys`, `send_mouse_move`, `send_mouse_click` to interact.
5.  `take_screenshot` to verify the result visually.
6.  `get_app_logs` and `app_status` when something goes wrong, `stop_app` when done.

**Notes**
*   Coordinates are viewport pixels with the origin at the top-left corner.
*   `send_keys` needs either `text` (typed as-is) or `key` (a named key, optionally with modifiers ctrl/shift/alt/cmd).
*   \"Not connected\" results from interactive tools are not failures; connect first.
*   Application errors such as \"No viewport found\" come from the app itself and are reported verbatim.

Current date and time: {current_date_time}
Operating system: {current_os}
"
    )
}
