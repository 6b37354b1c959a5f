//! Static error pages served by the frontend
//!
//! Templates carry `{{button_name}}` and `{{button_url}}` placeholders
//! filled from `default.error_responses`, falling back to the project
//! defaults.

use crate::config::ErrorResponses;

pub const DEFAULT_BUTTON_NAME: &str = "Shiroxy";
pub const DEFAULT_BUTTON_URL: &str = "https://github.com/shiroxy/shiroxy-rs";

pub const DOMAIN_NOT_FOUND_ERROR: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>404 Not Found</title>
    <style>
      * { box-sizing: border-box; margin: 0; padding: 0; }
      body, html {
        height: 100%;
        font-family: "Arial", sans-serif;
        background: #080e1f;
        display: flex;
        justify-content: center;
        align-items: center;
        text-align: center;
      }
      .container { padding: 20px; }
      .main-heading { font-size: 2em; color: #ffffff; margin-bottom: 10px; }
      .sub-heading { font-size: 1.5em; color: #666; margin-bottom: 20px; }
      .info-text { color: #888; margin-bottom: 30px; }
      .button {
        display: inline-block;
        padding: 10px 20px;
        font-size: 1em;
        border: none;
        border-radius: 5px;
        background: #1D56C4;
        color: white;
        text-decoration: none;
        transition: background 0.3s;
      }
      .button:hover { background: #4b6cb7; }
    </style>
  </head>
  <body>
    <div class="container">
      <h1 class="main-heading">Oops! Page not found.</h1>
      <h2 class="sub-heading">
        We can't seem to find the page you're looking for.
      </h2>
      <p class="info-text">
        The page you are looking for might have been removed, had its name
        changed, or is temporarily unavailable.
      </p>
      <a href="{{button_url}}" target="_blank" class="button">{{button_name}}</a>
    </div>
  </body>
</html>"#;

pub const PROXY_NOT_READY: &str = r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>Service Unavailable</title>
    <style>
      * { box-sizing: border-box; margin: 0; padding: 0; }
      body, html {
        height: 100%;
        font-family: "Arial", sans-serif;
        background: #080e1f;
        display: flex;
        justify-content: center;
        align-items: center;
        text-align: center;
      }
      .container { padding: 20px; }
      .main-heading { font-size: 2em; color: #ffffff; margin-bottom: 10px; }
      .sub-heading { font-size: 1.5em; color: #666; margin-bottom: 20px; }
      .info-text { color: #888; margin-bottom: 30px; }
      .button {
        display: inline-block;
        padding: 10px 20px;
        font-size: 1em;
        border: none;
        border-radius: 5px;
        background: #1D56C4;
        color: white;
        text-decoration: none;
        transition: background 0.3s;
      }
      .button:hover { background: #4b6cb7; }
    </style>
  </head>
  <body>
    <div class="container">
      <h1 class="main-heading">Proxy not ready.</h1>
      <h2 class="sub-heading">No backend is able to serve this request.</h2>
      <p class="info-text">
        The upstream servers are unreachable or still starting up. Please
        try again shortly.
      </p>
      <a href="{{button_url}}" target="_blank" class="button">{{button_name}}</a>
    </div>
  </body>
</html>"#;

/// Fill the template placeholders from config, applying defaults for
/// empty values.
pub fn render_error_page(template: &str, config: &ErrorResponses) -> String {
    let button_name = if config.page_button_name.is_empty() {
        DEFAULT_BUTTON_NAME
    } else {
        &config.page_button_name
    };
    let button_url = if config.page_button_url.is_empty() {
        DEFAULT_BUTTON_URL
    } else {
        &config.page_button_url
    };

    template
        .replace("{{button_name}}", button_name)
        .replace("{{button_url}}", button_url)
}
