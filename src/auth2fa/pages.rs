//! HTML served by the 2FA web interface.

/// The single interactive page. Polls `/status` every 2 seconds, posts the
/// code as JSON, and offers a resend button.
pub const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>iPhoto Downloader - Two-Factor Authentication</title>
<style>
body {
    font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
    margin: 0; padding: 20px;
    background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
    min-height: 100vh; display: flex; align-items: center; justify-content: center;
}
.container {
    background: white; border-radius: 12px; padding: 40px;
    box-shadow: 0 10px 30px rgba(0,0,0,0.2); max-width: 480px; width: 100%;
    text-align: center;
}
h1 { color: #333; margin-bottom: 6px; }
h2 { color: #666; font-weight: 300; margin-top: 0; }
#status { font-weight: bold; }
.state-awaiting_code, .state-listening, .state-requested { color: #17a2b8; }
.state-validating { color: #ffc107; }
.state-success { color: #28a745; }
.state-failed, .state-cancelled { color: #dc3545; }
#message {
    background: #e9ecef; border-left: 4px solid #007bff; padding: 12px;
    margin: 15px 0; text-align: left; border-radius: 0 4px 4px 0;
}
input[type="text"] {
    padding: 12px 16px; border: 2px solid #ddd; border-radius: 6px;
    font-size: 18px; text-align: center; font-family: monospace;
    letter-spacing: 2px; width: 130px;
}
button {
    background: #007bff; color: white; border: none; padding: 12px 24px;
    border-radius: 6px; cursor: pointer; font-size: 16px; margin: 6px;
}
button:hover { background: #0056b3; }
button.secondary { background: #6c757d; }
button.secondary:hover { background: #545b62; }
</style>
<script>
let pollTimer;

function refresh() {
    fetch('/status')
        .then(r => r.json())
        .then(data => {
            const statusEl = document.getElementById('status');
            statusEl.textContent = data.state;
            statusEl.className = 'state-' + data.state;
            const messageEl = document.getElementById('message');
            messageEl.textContent = data.message || '';
            messageEl.style.display = data.message ? 'block' : 'none';
            const form = document.getElementById('code-form');
            form.style.display =
                (data.state === 'success' || data.state === 'failed' ||
                 data.state === 'cancelled') ? 'none' : 'block';
            if (data.state === 'success' || data.state === 'failed' ||
                data.state === 'cancelled') {
                clearInterval(pollTimer);
            }
        })
        .catch(err => console.error('status poll failed', err));
}

function submitCode() {
    const code = document.getElementById('code').value.trim();
    fetch('/submit', {
        method: 'POST',
        headers: { 'Content-Type': 'application/json' },
        body: JSON.stringify({ code: code })
    })
        .then(r => r.json())
        .then(data => {
            if (data.accepted) { document.getElementById('code').value = ''; }
            refresh();
        })
        .catch(err => console.error('submit failed', err));
}

function requestCode() {
    fetch('/request', { method: 'POST' })
        .then(() => refresh())
        .catch(err => console.error('request failed', err));
}

window.onload = function () {
    refresh();
    pollTimer = setInterval(refresh, 2000);
    document.getElementById('code').addEventListener('keypress', function (e) {
        if (e.key === 'Enter') { submitCode(); }
    });
};
</script>
</head>
<body>
<div class="container">
    <h1>iPhoto Downloader</h1>
    <h2>Two-Factor Authentication</h2>
    <p><strong>Status:</strong> <span id="status">checking…</span></p>
    <div id="message" style="display:none"></div>
    <div id="code-form">
        <p>Enter the 6-digit verification code from your trusted device.</p>
        <input type="text" id="code" placeholder="123456" maxlength="6"
               pattern="[0-9]{6}" autocomplete="one-time-code">
        <button onclick="submitCode()">Submit Code</button>
        <div>
            <button class="secondary" onclick="requestCode()">Request New Code</button>
        </div>
    </div>
    <p><small>This page can be closed once authentication completes.</small></p>
</div>
</body>
</html>
"#;
